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

//! Implementation crate for the `neatx` session broker: the login
//! front-end, the per-user session broker, and the per-session node daemon
//! that supervises the display agent.

use std::io::{self, BufReader, Write as _};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use neatx_protocol::nxline;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod auth;
pub mod broker;
pub mod config;
pub mod consts;
pub mod daemon;
pub mod errors;
pub mod frontend;
pub mod retry;
pub mod store;
pub mod tty;
pub mod user;

/// Command-line arguments for the `neatx` binary. Each subcommand
/// corresponds to one of the three processes that make up a session's
/// pipeline (§2); `version` is handled by the wrapping binary.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(short, long, action, help = "file to write logs to; stderr if omitted outside daemon mode")]
    pub log_file: Option<String>,

    #[clap(short, long, action = clap::ArgAction::Count, help = "show more in logs, may be provided multiple times")]
    pub verbose: u8,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "print version")]
    Version,

    #[clap(name = "front-end", about = "speak the pre-login NX dialog on the current stdio")]
    FrontEnd,

    #[clap(about = "run the per-user session broker on the current stdio, as the authenticated user")]
    Broker {
        #[clap(help = "owning username")]
        username: String,
        #[clap(long, help = "protocol version the front-end already negotiated")]
        proto: String,
        #[clap(long, action, help = "unused, accepted for compatibility with the authenticator's argv")]
        debug: bool,
        #[clap(long, action, help = "unused, accepted for compatibility with the authenticator's argv")]
        logtostderr: bool,
    },

    #[clap(name = "node-daemon", about = "run the per-session node daemon; spawned by the broker, not for interactive use")]
    NodeDaemon {
        #[clap(help = "owning username")]
        username: String,
        #[clap(help = "session id")]
        id: String,
    },
}

impl Args {
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Dispatches to the requested subcommand after wiring up logging and
/// configuration, mirroring the teacher's top-level `run()`.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    if let Some(log_file) = &args.log_file {
        let file = std::fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    } else if matches!(args.command, Commands::NodeDaemon { .. }) {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let cfg = config::read_config(&args.config_file).context("reading configuration")?;

    match args.command {
        Commands::Version => Err(anyhow!("wrapper binary must handle version")),
        Commands::FrontEnd => run_front_end(&cfg),
        Commands::Broker { username, .. } => run_broker(&cfg, &username),
        Commands::NodeDaemon { username, id } => run_node(&cfg, &username, &id),
    }
}

/// Path to the current executable, used to build the argv the authenticator
/// execs into once login succeeds (`<neatx> broker <user> --proto=<V>`).
fn current_exe_path() -> anyhow::Result<String> {
    Ok(std::env::current_exe()?.to_string_lossy().into_owned())
}

fn run_front_end(cfg: &config::Config) -> anyhow::Result<()> {
    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let mut stdout = io::stdout();
    let authenticator = auth::from_config(cfg)?;
    let broker_path = current_exe_path()?;

    frontend::run(&mut reader, &mut stdout, stdin.as_raw_fd(), cfg, authenticator.as_ref(), &broker_path)
}

fn run_broker(cfg: &config::Config, username: &str) -> anyhow::Result<()> {
    let store = store::SessionStore::new(cfg.sessions_dir());
    let clock = retry::SystemClock;
    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let mut stdout = io::stdout();
    let hostname = user::hostname()?;
    let neatx_bin = PathBuf::from(current_exe_path()?);

    write!(&mut stdout, "{}", nxline::format_prompt(103, Some(&format!("Welcome to: {hostname} user: {username}"))))?;
    stdout.flush()?;

    let last_session =
        run_broker_loop(&mut reader, &mut stdout, &store, username, &hostname, &neatx_bin, &clock)?;

    if let Some(port) = last_session.and_then(|s| s.port) {
        broker::spawn_data_relay(&cfg.data_relay_path(), port)?;
    }
    Ok(())
}

/// Maps a session-lifecycle failure to the wire error the broker sends
/// back to the client (§7 kinds 4, 7, 8; everything else falls back to a
/// plain 500). Unlike the pre-login front-end's fatal errors, these stay
/// non-fatal: the broker connection is already authenticated, so letting
/// the client retry on the same connection beats forcing a reconnect.
fn session_error_to_protocol(err: &anyhow::Error) -> errors::ProtocolError {
    if let Some(e) = err.downcast_ref::<errors::SessionParameterError>() {
        return errors::ProtocolError::new(500, e.to_string());
    }
    if let Some(e) = err.downcast_ref::<errors::InvalidSessionState>() {
        return errors::ProtocolError::new(500, e.to_string());
    }
    if err.downcast_ref::<errors::NoFreeDisplayNumberFound>().is_some() {
        return errors::ProtocolError::new(500, err.to_string());
    }
    if let Some(e) = err.downcast_ref::<errors::SessionNotReadyError>() {
        return errors::ProtocolError::new(500, e.to_string());
    }
    if let Some(e) = err.downcast_ref::<neatx_protocol::rpc::RpcError>() {
        return errors::ProtocolError::new(500, e.to_string());
    }
    errors::ProtocolError::new(500, format!("Error: {err}"))
}

fn reply_session_result(
    writer: &mut impl io::Write,
    result: anyhow::Result<store::Session>,
) -> anyhow::Result<()> {
    match result {
        Ok(sess) => {
            for (code, line) in broker::session_info_lines(&sess) {
                write!(writer, "{}", nxline::format_prompt(code, Some(&line)))?;
            }
        }
        Err(err) => {
            let proto = session_error_to_protocol(&err);
            write!(writer, "{}", nxline::format_prompt(proto.code, Some(&proto.message)))?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn parse_and_start(
    store: &store::SessionStore,
    clock: &dyn retry::Clock,
    neatx_bin: &std::path::Path,
    username: &str,
    hostname: &str,
    args: &str,
) -> anyhow::Result<store::Session> {
    let params = nxline::parse_parameters(args).map_err(|e| errors::ProtocolError::param_parse_error(&e.input))?;
    broker::start_session(store, clock, neatx_bin, username, hostname, &params)
}

#[allow(clippy::too_many_arguments)]
fn parse_and_attach(
    store: &store::SessionStore,
    clock: &dyn retry::Clock,
    neatx_bin: &std::path::Path,
    username: &str,
    hostname: &str,
    args: &str,
) -> anyhow::Result<store::Session> {
    let params = nxline::parse_parameters(args).map_err(|e| errors::ProtocolError::param_parse_error(&e.input))?;
    broker::attach_session(store, clock, neatx_bin, username, hostname, &params)
}

fn parse_and_restore(
    store: &store::SessionStore,
    clock: &dyn retry::Clock,
    username: &str,
    args: &str,
) -> anyhow::Result<store::Session> {
    let params = nxline::parse_parameters(args).map_err(|e| errors::ProtocolError::param_parse_error(&e.input))?;
    broker::restore_session(store, clock, username, &params)
}

#[allow(clippy::too_many_arguments)]
fn run_broker_loop(
    reader: &mut impl io::BufRead,
    writer: &mut impl io::Write,
    store: &store::SessionStore,
    username: &str,
    hostname: &str,
    neatx_bin: &std::path::Path,
    clock: &dyn retry::Clock,
) -> anyhow::Result<Option<store::Session>> {
    let mut last_session: Option<store::Session> = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(last_session);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }
        let (cmd, args) = nxline::split_command(trimmed);

        match cmd.as_str() {
            "listsession" => match nxline::parse_parameters(args) {
                Ok(params) => {
                    let filter = broker::listsession_filter(&params);
                    let sessions = store.find_sessions_with_filter(username, filter)?;
                    broker::write_listsession(writer, username, &sessions)?;
                }
                Err(e) => {
                    let err = errors::ProtocolError::param_parse_error(&e.input);
                    write!(writer, "{}", nxline::format_prompt(err.code, Some(&err.message)))?;
                    writer.flush()?;
                }
            },
            "startsession" => {
                let result = parse_and_start(store, clock, neatx_bin, username, hostname, args);
                if let Ok(sess) = &result {
                    last_session = Some(sess.clone());
                }
                reply_session_result(writer, result)?;
            }
            "attachsession" => {
                let result = parse_and_attach(store, clock, neatx_bin, username, hostname, args);
                if let Ok(sess) = &result {
                    last_session = Some(sess.clone());
                }
                reply_session_result(writer, result)?;
            }
            "restoresession" => {
                let result = parse_and_restore(store, clock, username, args);
                if let Ok(sess) = &result {
                    last_session = Some(sess.clone());
                }
                reply_session_result(writer, result)?;
            }
            "bye" | "quit" => {
                write!(writer, "{}", nxline::format_prompt(999, Some("Bye")))?;
                writer.flush()?;
                return Ok(last_session);
            }
            _ => {
                let err = errors::ProtocolError::undefined_command(&cmd);
                write!(writer, "{}", nxline::format_prompt(err.code, Some(&err.message)))?;
                writer.flush()?;
            }
        }
    }
}

/// Runs the per-session node daemon (§4.5): daemonizes, binds its RPC
/// socket, and drives the event loop until the agent it supervises exits.
/// Bring-up (Xauthority, the display agent itself) doesn't happen here; it
/// waits for the broker's `start` RPC, handled by `NodeDaemon::start`.
fn run_node(cfg: &config::Config, username: &str, session_id: &str) -> anyhow::Result<()> {
    let store = store::SessionStore::new(cfg.sessions_dir());
    let log_path = store.log_path(session_id);
    let socket_path = store.socket_path(session_id);
    daemon::daemonize(&log_path)?;

    daemon::signals::Handler::new(socket_path.clone()).spawn()?;

    let session = store
        .load_session_for_user(session_id, username)?
        .ok_or_else(|| anyhow!("no session {session_id} owned by {username}"))?;
    let mut node = daemon::NodeDaemon::new(store, cfg.clone(), session);

    let listener = daemon::rpcserver::bind(&socket_path)?;
    let (rpc_tx, rpc_conns) = crossbeam_channel::bounded(16);
    std::thread::spawn(move || {
        for conn in listener.incoming().flatten() {
            if rpc_tx.send(conn).is_err() {
                break;
            }
        }
    });

    node.run_event_loop(&rpc_conns);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn broker_loop_replies_999_to_bye() {
        let dir = tempfile::tempdir().unwrap();
        let store = store::SessionStore::new(dir.path());
        let clock = retry::SystemClock;
        let neatx_bin = PathBuf::from("/usr/bin/neatx");
        let mut reader = Cursor::new(b"bye\n".to_vec());
        let mut writer = Vec::new();
        run_broker_loop(&mut reader, &mut writer, &store, "alice", "nxhost", &neatx_bin, &clock).unwrap();
        assert!(String::from_utf8_lossy(&writer).contains("999"));
    }

    #[test]
    fn broker_loop_lists_sessions_for_the_current_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = store::SessionStore::new(dir.path());
        let clock = retry::SystemClock;
        let neatx_bin = PathBuf::from("/usr/bin/neatx");
        let mut reader = Cursor::new(b"listsession\nbye\n".to_vec());
        let mut writer = Vec::new();
        run_broker_loop(&mut reader, &mut writer, &store, "alice", "nxhost", &neatx_bin, &clock).unwrap();
        assert!(String::from_utf8_lossy(&writer).contains("Display"));
    }

    #[test]
    fn broker_loop_rejects_unknown_commands() {
        let dir = tempfile::tempdir().unwrap();
        let store = store::SessionStore::new(dir.path());
        let clock = retry::SystemClock;
        let neatx_bin = PathBuf::from("/usr/bin/neatx");
        let mut reader = Cursor::new(b"frobnicate\nbye\n".to_vec());
        let mut writer = Vec::new();
        run_broker_loop(&mut reader, &mut writer, &store, "alice", "nxhost", &neatx_bin, &clock).unwrap();
        assert!(String::from_utf8_lossy(&writer).contains("503"));
    }

    #[test]
    fn broker_loop_rejects_startsession_missing_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = store::SessionStore::new(dir.path());
        let clock = retry::SystemClock;
        let neatx_bin = PathBuf::from("/usr/bin/neatx");
        let mut reader = Cursor::new(b"startsession --session=\"x\"\nbye\n".to_vec());
        let mut writer = Vec::new();
        run_broker_loop(&mut reader, &mut writer, &store, "alice", "nxhost", &neatx_bin, &clock).unwrap();
        assert!(String::from_utf8_lossy(&writer).contains("500"));
    }

    #[test]
    fn broker_loop_rejects_attachsession_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = store::SessionStore::new(dir.path());
        let clock = retry::SystemClock;
        let neatx_bin = PathBuf::from("/usr/bin/neatx");
        let mut reader = Cursor::new(b"attachsession --id=\"NOPE\"\nbye\n".to_vec());
        let mut writer = Vec::new();
        run_broker_loop(&mut reader, &mut writer, &store, "alice", "nxhost", &neatx_bin, &clock).unwrap();
        assert!(String::from_utf8_lossy(&writer).contains("500"));
    }
}
