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

//! The local RPC envelope spoken over the session's Unix socket between the
//! session broker (client) and the node daemon (server): JSON objects
//! terminated by a NUL byte rather than length-prefixed or newline-framed.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The node daemon commands a broker may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Attach,
    Restore,
    Terminate,
    GetShadowCookie,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Attach => "attach",
            Command::Restore => "restore",
            Command::Terminate => "terminate",
            Command::GetShadowCookie => "getshadowcookie",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Command::Start),
            "attach" => Some(Command::Attach),
            "restore" => Some(Command::Restore),
            "terminate" => Some(Command::Terminate),
            "getshadowcookie" => Some(Command::GetShadowCookie),
            _ => None,
        }
    }
}

/// `{ "cmd": <command>, "args": <value> }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub cmd: String,
    #[serde(default)]
    pub args: Value,
}

impl Request {
    pub fn new(cmd: Command, args: Value) -> Self {
        Request { cmd: cmd.as_str().to_string(), args }
    }
}

/// The start/attach/restore parameter map, always sent as `args` for those
/// three commands: the parsed `--name="value"` pairs from the client's
/// command line.
pub type ParamMap = BTreeMap<String, String>;

/// `attach`'s argument shape is the two-element array `[params,
/// shadow_cookie]` rather than a bare parameter map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachArgs {
    pub params: ParamMap,
    pub shadow_cookie: Option<String>,
}

/// `{ "success": <bool>, "result": <value> }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub result: Value,
}

impl Response {
    pub fn ok(result: Value) -> Self {
        Response { success: true, result }
    }

    pub fn err(err: &RpcError) -> Self {
        Response { success: false, result: err.to_wire() }
    }
}

/// A typed error crossing the RPC boundary, carried on the wire as the
/// two-element `[<error-kind>, [<arg>, ...]]` array from §4.5/§9 so the
/// caller can reconstruct a tagged-variant error rather than a bare
/// string. Unknown kinds on the receiving side collapse to `Generic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    Generic(String),
    SessionParameter(String),
    InvalidSessionState(String),
    NoFreeDisplayNumberFound,
    IllegalCharacter(String),
    NotFound(String),
}

impl RpcError {
    fn kind_tag(&self) -> &'static str {
        match self {
            RpcError::Generic(_) => "GenericError",
            RpcError::SessionParameter(_) => "SessionParameterError",
            RpcError::InvalidSessionState(_) => "InvalidSessionState",
            RpcError::NoFreeDisplayNumberFound => "NoFreeDisplayNumberFound",
            RpcError::IllegalCharacter(_) => "IllegalCharacterError",
            RpcError::NotFound(_) => "NotFoundError",
        }
    }

    fn args(&self) -> Vec<Value> {
        match self {
            RpcError::Generic(msg)
            | RpcError::SessionParameter(msg)
            | RpcError::InvalidSessionState(msg)
            | RpcError::IllegalCharacter(msg)
            | RpcError::NotFound(msg) => vec![Value::String(msg.clone())],
            RpcError::NoFreeDisplayNumberFound => vec![],
        }
    }

    fn to_wire(&self) -> Value {
        Value::Array(vec![Value::String(self.kind_tag().to_string()), Value::Array(self.args())])
    }

    /// Reconstructs a typed error from a failure response's `result`
    /// field. Malformed or unrecognized envelopes collapse to `Generic`
    /// rather than panicking, per §9: "Unknown tags collapse to a
    /// generic error."
    pub fn from_wire(result: &Value) -> Self {
        let fallback = || RpcError::Generic(result.to_string());

        let Some(arr) = result.as_array() else { return fallback() };
        if arr.len() != 2 {
            return fallback();
        }
        let Some(tag) = arr[0].as_str() else { return fallback() };
        let first_arg = arr[1]
            .as_array()
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        match tag {
            "SessionParameterError" => RpcError::SessionParameter(first_arg),
            "InvalidSessionState" => RpcError::InvalidSessionState(first_arg),
            "NoFreeDisplayNumberFound" => RpcError::NoFreeDisplayNumberFound,
            "IllegalCharacterError" => RpcError::IllegalCharacter(first_arg),
            "NotFoundError" => RpcError::NotFound(first_arg),
            _ => RpcError::Generic(first_arg),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Generic(msg) => write!(f, "{msg}"),
            RpcError::SessionParameter(msg) => write!(f, "session parameter error: {msg}"),
            RpcError::InvalidSessionState(msg) => write!(f, "invalid session state: {msg}"),
            RpcError::NoFreeDisplayNumberFound => write!(f, "no free display number found"),
            RpcError::IllegalCharacter(msg) => write!(f, "illegal character: {msg}"),
            RpcError::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for RpcError {}

/// Writes a NUL-terminated JSON value to `w`.
pub fn encode_to<T: Serialize, W: Write>(w: &mut W, value: &T) -> anyhow::Result<()> {
    let mut buf = serde_json::to_vec(value)?;
    buf.push(0);
    w.write_all(&buf)?;
    w.flush()?;
    Ok(())
}

/// Reads bytes from `r` until a NUL byte is found and decodes the
/// preceding bytes as JSON. Returns `Ok(None)` on clean EOF before any
/// data was read (the peer closed the connection).
pub fn decode_from<T: for<'de> Deserialize<'de>, R: Read>(
    r: &mut R,
) -> anyhow::Result<Option<T>> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match r.read(&mut byte) {
            Ok(0) => {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err(anyhow::anyhow!("connection closed mid-message"));
            }
            Ok(_) => {
                if byte[0] == 0 {
                    break;
                }
                buf.push(byte[0]);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(serde_json::from_slice(&buf)?))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_round_trip() {
        let req = Request::new(Command::Start, serde_json::json!({"session": "x"}));
        let mut buf = Vec::new();
        encode_to(&mut buf, &req).unwrap();
        assert_eq!(*buf.last().unwrap(), 0);

        let mut cur = Cursor::new(buf);
        let decoded: Request = decode_from(&mut cur).unwrap().unwrap();
        assert_eq!(decoded.cmd, "start");
    }

    #[test]
    fn decode_from_clean_eof_is_none() {
        let mut cur = Cursor::new(Vec::<u8>::new());
        let decoded: Option<Request> = decode_from(&mut cur).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn rpc_error_round_trips_through_wire() {
        let err = RpcError::SessionParameter("missing session".to_string());
        let resp = Response::err(&err);
        assert!(!resp.success);
        let reconstructed = RpcError::from_wire(&resp.result);
        assert_eq!(reconstructed, err);
    }

    #[test]
    fn unknown_error_kind_collapses_to_generic() {
        let wire = serde_json::json!(["TotallyUnknownError", ["oops"]]);
        match RpcError::from_wire(&wire) {
            RpcError::Generic(msg) => assert_eq!(msg, "oops"),
            other => panic!("expected Generic, got {other:?}"),
        }
    }

    #[test]
    fn command_parse_round_trip() {
        for cmd in
            [Command::Start, Command::Attach, Command::Restore, Command::Terminate, Command::GetShadowCookie]
        {
            assert_eq!(Command::parse(cmd.as_str()), Some(cmd));
        }
        assert_eq!(Command::parse("bogus"), None);
    }
}
