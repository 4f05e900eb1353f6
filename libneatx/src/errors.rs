// Copyright 2024 Neatx Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Typed error kinds that need to be recovered by identity at a handful of
//! call sites (protocol error -> wire code, RPC failures -> tagged
//! variants). Everywhere else uses plain `anyhow::Error` with `.context()`
//! chains, the same split the teacher's daemon code makes between its
//! unit-struct `BusyError`/`ShellSelectionError` and its ambient
//! `anyhow::Result` plumbing.

use std::fmt;

/// A protocol-layer failure (§7, kind 1). Carries the wire status code and
/// message that should be sent to the client, plus whether the connection
/// must be closed afterward.
#[derive(Debug, Clone)]
pub struct ProtocolError {
    pub code: u16,
    pub message: String,
    pub fatal: bool,
}

impl ProtocolError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        ProtocolError { code, message: message.into(), fatal: false }
    }

    pub fn fatal(code: u16, message: impl Into<String>) -> Self {
        ProtocolError { code, message: message.into(), fatal: true }
    }

    pub fn undefined_command(command: &str) -> Self {
        ProtocolError::new(503, format!("Error: undefined command: '{command}'"))
    }

    pub fn not_before_login(command: &str) -> Self {
        ProtocolError::new(
            554,
            format!("Error: the command '{command}' cannot be called before to login"),
        )
    }

    pub fn not_after_login(command: &str) -> Self {
        ProtocolError::new(
            554,
            format!("Error: the command '{command}' cannot be called after login"),
        )
    }

    pub fn unsupported_protocol() -> Self {
        // Code 500, not 552: clients otherwise ignore the error.
        ProtocolError::fatal(
            500,
            "Protocol you requested is not supported, please upgrade your client to latest version",
        )
    }

    pub fn unencrypted_not_allowed() -> Self {
        ProtocolError::new(594, "ERROR: Unencrypted sessions are not allowed on this server")
    }

    pub fn param_parse_error(params: &str) -> Self {
        ProtocolError::new(
            597,
            format!("Error: Parsing parameters: string \"{params}\" has invalid format"),
        )
    }

    pub fn internal() -> Self {
        ProtocolError::fatal(500, "Internal error")
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ProtocolError {}

/// Normal termination of the protocol loop (§7, kinds 2 and 3).
#[derive(Debug, Clone, Copy)]
pub enum QuitKind {
    /// Emits code 999 before closing.
    Announced,
    /// Closes silently (used after the authenticator takes over stdio).
    Quiet,
}

#[derive(Debug, Clone, Copy)]
pub struct Quit(pub QuitKind);

impl fmt::Display for Quit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "quit ({:?})", self.0)
    }
}

impl std::error::Error for Quit {}

/// Authentication failed after a full PTY dialog (wrong password, helper
/// exited non-zero, mismatched prompt).
#[derive(Debug, Clone)]
pub struct AuthFailedError(pub String);

impl fmt::Display for AuthFailedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authentication failed: {}", self.0)
    }
}

impl std::error::Error for AuthFailedError {}

/// The PTY dialog did not reach a decision (password prompt or `NX> `)
/// within the configured timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthTimeoutError;

impl fmt::Display for AuthTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authentication timed out")
    }
}

impl std::error::Error for AuthTimeoutError {}

/// The configured authentication method name does not match a known
/// authenticator (§7, kind 6: configuration fault, fatal at startup).
#[derive(Debug, Clone)]
pub struct UnknownAuthMethod(pub String);

impl fmt::Display for UnknownAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown authentication method: {}", self.0)
    }
}

impl std::error::Error for UnknownAuthMethod {}

/// A `startsession`/`attachsession`/`restoresession` request was missing a
/// required parameter or carried an invalid one (§7, kind 4; maps to
/// protocol 500 fatal).
#[derive(Debug, Clone)]
pub struct SessionParameterError(pub String);

impl fmt::Display for SessionParameterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session parameter error: {}", self.0)
    }
}

impl std::error::Error for SessionParameterError {}

/// Assigning a state outside `VALID_STATES` to a session record, or
/// otherwise violating the state machine's invariants (§7, kind 7: a
/// programming fault, expected to crash loudly rather than be recovered).
#[derive(Debug, Clone)]
pub struct InvalidSessionState(pub String);

impl fmt::Display for InvalidSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session state: {}", self.0)
    }
}

impl std::error::Error for InvalidSessionState {}

/// No display number could be allocated after exhausting every sampled
/// candidate (§7, kind 8; the broker returns 500 to the client).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFreeDisplayNumberFound;

impl fmt::Display for NoFreeDisplayNumberFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no free display number found")
    }
}

impl std::error::Error for NoFreeDisplayNumberFound {}

/// An option value contained a comma, which would corrupt the
/// comma-separated options file (§7, kind 9; fatal inside the node
/// daemon).
#[derive(Debug, Clone)]
pub struct IllegalCharacterError(pub String);

impl fmt::Display for IllegalCharacterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal character in option value: {:?}", self.0)
    }
}

impl std::error::Error for IllegalCharacterError {}

/// A session was requested for a node daemon that is still starting and
/// whose socket refuses connections past the retry budget, or a target
/// session's daemon was not found at all for a shadow attach.
#[derive(Debug, Clone)]
pub struct SessionNotReadyError(pub String);

impl fmt::Display for SessionNotReadyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session not ready: {}", self.0)
    }
}

impl std::error::Error for SessionNotReadyError {}
