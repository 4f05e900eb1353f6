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

//! The login front-end (§4.3): the first process to see a freshly opened
//! client transport. Negotiates the protocol version, collects
//! credentials, and hands off to an [`Authenticator`] which either runs
//! the rest of the session or reports why it couldn't.

use std::io::{BufRead, Write};
use std::os::unix::io::RawFd;

use neatx_protocol::nxline;
use tracing::info;

use crate::auth::{self, Authenticator};
use crate::config::Config;
use crate::errors::{AuthFailedError, ProtocolError, Quit, QuitKind};
use crate::tty;

/// Drives the front-end's whole conversation on `stream` until the client
/// logs in (and control is handed to the authenticator), quits, or a
/// protocol error closes the connection.
pub fn run(
    reader: &mut impl BufRead,
    writer: &mut impl Write,
    password_fd: RawFd,
    cfg: &Config,
    auth: &dyn Authenticator,
    broker_path: &str,
) -> anyhow::Result<()> {
    let version = cfg.protocol_version().to_string();
    write!(writer, "HELLO NXSERVER - Version {version} - GPL\n")?;
    writer.flush()?;

    let mut hello_seen = false;
    let mut line = String::new();

    loop {
        line.clear();
        write!(writer, "{}", nxline::format_prompt(105, None))?;
        writer.flush()?;

        if reader.read_line(&mut line)? == 0 {
            return Ok(()); // client hung up
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }

        let (cmd, args) = nxline::split_command(trimmed);

        match cmd.as_str() {
            "hello" if !hello_seen => match parse_hello(args, &version) {
                Ok(()) => {
                    hello_seen = true;
                    write!(writer, "{}", nxline::format_prompt(134, Some(&format!("Accepted protocol: {version}"))))?;
                    writer.flush()?;
                }
                Err(err) => return reply_and_maybe_close(writer, &err),
            },
            "set" if hello_seen => match parse_set(args) {
                Ok(()) => {}
                Err(err) => return reply_and_maybe_close(writer, &err),
            },
            "login" if hello_seen => {
                return handle_login(reader, writer, password_fd, &version, auth, broker_path);
            }
            "bye" | "startsession" | "attachsession" if hello_seen => {
                let err = ProtocolError::not_before_login(&cmd);
                reply_and_maybe_close(writer, &err)?;
            }
            "quit" => return Ok(()),
            _ => {
                let err = ProtocolError::undefined_command(&cmd);
                if reply_and_maybe_close(writer, &err).is_err() {
                    return Ok(());
                }
            }
        }
    }
}

fn reply_and_maybe_close(writer: &mut impl Write, err: &ProtocolError) -> anyhow::Result<()> {
    write!(writer, "{}", nxline::format_prompt(err.code, Some(&err.message)))?;
    writer.flush()?;
    if err.fatal {
        return Err(Quit(QuitKind::Announced).into());
    }
    Ok(())
}

fn parse_hello(args: &str, expected_version: &str) -> Result<(), ProtocolError> {
    let rest = args.strip_prefix("nxclient").ok_or_else(ProtocolError::unsupported_protocol)?;
    let version_str = rest
        .split("version")
        .nth(1)
        .map(str::trim)
        .ok_or_else(ProtocolError::unsupported_protocol)?;

    let digits = [2, 2, 4];
    let got = nxline::parse_version(version_str, ".", &digits).map_err(|_| ProtocolError::unsupported_protocol())?;
    let want = nxline::parse_version(expected_version, ".", &digits).map_err(|_| ProtocolError::internal())?;

    if got != want {
        return Err(ProtocolError::unsupported_protocol());
    }
    Ok(())
}

fn parse_set(args: &str) -> Result<(), ProtocolError> {
    let mut parts = args.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("auth_mode"), Some("password")) => Ok(()),
        (Some("shell_mode"), Some("shell")) => Ok(()),
        _ => Err(ProtocolError::new(500, format!("Error: invalid set command: '{args}'"))),
    }
}

fn handle_login(
    reader: &mut impl BufRead,
    writer: &mut impl Write,
    password_fd: RawFd,
    version: &str,
    auth: &dyn Authenticator,
    broker_path: &str,
) -> anyhow::Result<()> {
    write!(writer, "{}", nxline::format_prompt(101, None))?;
    writer.flush()?;
    let mut username = String::new();
    reader.read_line(&mut username)?;
    let username = username.trim_end_matches(['\r', '\n']).to_string();

    write!(writer, "{}", nxline::format_prompt(102, None))?;
    writer.flush()?;
    let mut password = String::new();
    let _echo_guard = tty::disable_echo(password_fd).ok();
    reader.read_line(&mut password)?;
    drop(_echo_guard);
    let password = password.trim_end_matches(['\r', '\n']).to_string();

    if username.is_empty() || password.is_empty() {
        let err = ProtocolError::fatal(500, "Error: login failed: empty credentials");
        return reply_and_maybe_close(writer, &err);
    }

    let argv = vec![
        broker_path.to_string(),
        "broker".to_string(),
        username.clone(),
        "--proto".to_string(),
        version.to_string(),
    ];

    match auth::authenticate_and_run(auth, &username, &password, &argv) {
        Ok(_status) => {
            info!("session for {username} completed");
            Ok(())
        }
        Err(e) if e.downcast_ref::<AuthFailedError>().is_some() => {
            let err = ProtocolError::new(404, "Error: authentication failed");
            reply_and_maybe_close(writer, &err)
        }
        Err(e) => {
            let err = ProtocolError::fatal(503, "Error: internal authentication error");
            let _ = reply_and_maybe_close(writer, &err);
            Err(e)
        }
    }
}
