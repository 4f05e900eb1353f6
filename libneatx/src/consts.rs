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

//! Paths, timeouts, and other magic constants pinned by the protocol and
//! filesystem layout rather than left to configuration.

use std::time::Duration;

/// Name of the per-session record file inside a session directory.
pub const SESSION_DATA_FILE_NAME: &str = "neatx.data";
/// Name of the Xauthority blob inside a session directory.
pub const SESSION_AUTHORITY_FILE_NAME: &str = "authority";
/// Name of the options file consumed by the display agent.
pub const SESSION_OPTIONS_FILE_NAME: &str = "options";
/// Name of the application log file inside a session directory.
pub const SESSION_LOG_FILE_NAME: &str = "app.log";
/// Name of the node daemon's RPC socket inside a session directory.
pub const NODE_SOCKET_NAME: &str = "nxnode.sock";

/// Display numbers are drawn from this half-open range.
pub const DISPLAY_RANGE: std::ops::Range<u32> = 20..1000;
/// How many random candidates to sample per allocation attempt.
pub const DISPLAY_SAMPLE_COUNT: usize = 10;
/// TCP port corresponding to X display 0.
pub const X_TCP_PORT_BASE: u16 = 6000;

pub const DEFAULT_APP_UMASK: u32 = 0o077;
pub const DEFAULT_NX_PROTOCOL_VERSION: &str = "3.3.0";
pub const DEFAULT_SUBSCRIPTION: &str = "GPL";
pub const PROTOCOL_VERSION_DIGITS: [u32; 3] = [2, 2, 4];
pub const PROTOCOL_VERSION_SEP: &str = ".";

pub const AUTH_METHOD_SU: &str = "su";
pub const AUTH_METHOD_SSH: &str = "ssh";
pub const DEFAULT_SSH_PORT: u16 = 22;

/// PTY dialog timeout for the authenticator (§4.3.1 / §5).
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Node-socket connect retry: start, growth factor, per-step cap, budget.
pub const CONNECT_RETRY_START: Duration = Duration::from_millis(100);
pub const CONNECT_RETRY_GROWTH: f64 = 1.1;
pub const CONNECT_RETRY_BUDGET: Duration = Duration::from_secs(10);

/// Session-readiness poll retry: start, growth factor, per-step cap.
pub const READY_RETRY_START: Duration = Duration::from_millis(100);
pub const READY_RETRY_GROWTH: f64 = 1.5;
pub const READY_RETRY_STEP_CAP: Duration = Duration::from_secs(1);
pub const READY_RETRY_BUDGET_START: Duration = Duration::from_secs(30);
pub const READY_RETRY_BUDGET_RESTORE: Duration = Duration::from_secs(60);

/// Number of times `CreateSessionId` retries on a directory collision
/// before giving up.
pub const SESSION_ID_CREATE_RETRIES: u32 = 10;

pub const STDIN_FILENO: i32 = 0;
pub const STDOUT_FILENO: i32 = 1;
pub const STDERR_FILENO: i32 = 2;
