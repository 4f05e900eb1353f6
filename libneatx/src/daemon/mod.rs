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

//! The per-session node daemon: self-daemonizes, runs the session
//! bring-up pipeline, and drives a single-threaded event loop that
//! multiplexes the RPC listener, the agent's stderr, and child-exit
//! notifications (§4.5, §5).

pub mod agent;
pub mod display;
pub mod options;
pub mod rpcserver;
pub mod signals;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use anyhow::Context;
use crossbeam_channel::{bounded, Receiver, Sender};
use neatx_protocol::rpc::{AttachArgs, ParamMap, RpcError};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::consts;
use crate::store::{Session, SessionState, SessionStore};
use agent::{Action, AgentSupervisor};

/// Double-forks into the background: cwd `/`, umask 077, stdio redirected
/// to `log_path`. Must be called before any threads are spawned.
pub fn daemonize(log_path: &Path) -> anyhow::Result<()> {
    let log_out = File::create(log_path).with_context(|| format!("opening {log_path:?}"))?;
    let log_err = log_out.try_clone()?;

    daemonize::Daemonize::new()
        .working_directory("/")
        .umask(consts::DEFAULT_APP_UMASK)
        .stdout(log_out)
        .stderr(log_err)
        .start()
        .context("forking into the background")
}

/// Runs the session for its whole lifetime: bring-up, then the event loop,
/// until the agent exits. Bring-up is deferred until the broker's `start`
/// RPC arrives rather than run unconditionally at launch, since the daemon
/// process is spawned once per session and has nothing useful to do before
/// the broker hands it the go-ahead.
pub struct NodeDaemon {
    pub store: SessionStore,
    pub config: Config,
    pub supervisor: AgentSupervisor,
    agent_child: Option<Child>,
    pending_agent_streams: Option<(Receiver<String>, Receiver<()>)>,
}

impl NodeDaemon {
    pub fn new(store: SessionStore, config: Config, session: Session) -> Self {
        NodeDaemon {
            store,
            config,
            supervisor: AgentSupervisor::new(session),
            agent_child: None,
            pending_agent_streams: None,
        }
    }

    /// Step 1 of the bring-up pipeline: writes Xauthority entries for
    /// `:display` and `localhost:display` via the configured `xauth`
    /// binary, plus the shadow cookie pair for shadow sessions.
    pub fn write_xauthority(&self) -> anyhow::Result<()> {
        let sess = &self.supervisor.session;
        let auth_path = self.store.authority_path(&sess.id);

        for display_spec in [format!(":{}", sess.display), format!("localhost:{}", sess.display)] {
            run_xauth_add(&self.config.xauth_path(), &auth_path, &display_spec, &sess.cookie)?;
        }

        if let (Some(shadow_display), Some(shadow_cookie)) = (sess.shadow_display, &sess.shadow_cookie) {
            for display_spec in [format!(":{shadow_display}"), format!("localhost:{shadow_display}")] {
                run_xauth_add(&self.config.xauth_path(), &auth_path, &display_spec, shadow_cookie)?;
            }
        }

        Ok(())
    }

    /// Step 2: writes the options file and spawns the display agent with
    /// its stderr piped back for the supervisor to read.
    pub fn spawn_agent(&self) -> anyhow::Result<std::process::Child> {
        let sess = &self.supervisor.session;
        let options_path = self.store.options_path(&sess.id);
        options::write_options_file(&options_path, sess)?;

        let mut cmd = Command::new(self.config.agent_path());
        cmd.arg(format!(":{}", sess.display))
            .env("DISPLAY", options::display_env_var(&options_path, sess.display))
            .env("XAUTHORITY", self.store.authority_path(&sess.id))
            .stderr(Stdio::piped())
            .stdout(Stdio::null())
            .stdin(Stdio::null());

        if let Some(shadow_display) = sess.shadow_display {
            cmd.arg("-shadow").arg(format!("localhost:{shadow_display}"));
        }

        cmd.spawn().context("spawning display agent")
    }

    /// Step 3: applies resource-database settings. Failures here are
    /// logged and ignored, the session proceeds regardless (§4.5).
    pub fn apply_resource_database(&self) {
        let sess = &self.supervisor.session;
        let result = Command::new(self.config.xrdb_path())
            .arg("-display")
            .arg(format!(":{}", sess.display))
            .arg("-merge")
            .env("XAUTHORITY", self.store.authority_path(&sess.id))
            .status();

        match result {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("xrdb exited with {status}, continuing anyway"),
            Err(e) => warn!("failed to run xrdb, continuing anyway: {e}"),
        }
    }

    /// Step 4: launches the user's requested application as a login shell,
    /// exporting `LANG` from `~/.dmrc`'s `Language` key if present.
    pub fn spawn_user_application(&self, home_dir: &str, shell: &str, app_command: &str) -> anyhow::Result<std::process::Child> {
        let sess = &self.supervisor.session;
        let options_path = self.store.options_path(&sess.id);

        let mut cmd = Command::new(shell);
        let shell_basename = Path::new(shell).file_name().and_then(|n| n.to_str()).unwrap_or(shell);
        cmd.arg0(format!("-{shell_basename}"));
        cmd.arg("-c").arg(app_command);
        cmd.env("DISPLAY", options::display_env_var(&options_path, sess.display));

        if let Some(lang) = dmrc_language(home_dir) {
            cmd.env("LANG", lang);
        }

        cmd.spawn().context("spawning user application")
    }

    /// Runs bring-up steps 1 and 2 and starts reading the agent's stderr,
    /// stashing the resulting channels for `run_event_loop` to pick up on
    /// its next pass through the select. Seeds `agent_pid` from the spawned
    /// child immediately, since the stderr line that later reconciles it
    /// (`Info: Agent running with pid ...`) may not arrive before a
    /// `terminate`/`restore` needs to signal the process.
    fn bring_up(&mut self) -> anyhow::Result<()> {
        self.write_xauthority()?;
        let mut child = self.spawn_agent()?;
        self.supervisor.agent_pid = Some(child.id() as i32);
        let stderr = child.stderr.take().ok_or_else(|| anyhow::anyhow!("agent has no piped stderr"))?;
        let streams = spawn_line_reader(stderr);
        self.agent_child = Some(child);
        self.pending_agent_streams = Some(streams);
        Ok(())
    }

    /// Feeds one agent stderr line through the supervisor and executes the
    /// resulting actions against the daemon's owned processes.
    fn apply_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::PersistRecord => {
                    if let Err(e) = self.store.save_session(&mut self.supervisor.session) {
                        error!("failed to persist session record: {e:?}");
                    }
                }
                Action::DisplayReady => {
                    info!("display ready, proceeding to resource database and user application");
                    self.apply_resource_database();
                }
                Action::SendHangupToAgent => {
                    if let Some(pid) = self.supervisor.agent_pid {
                        send_signal(pid, nix::sys::signal::Signal::SIGHUP);
                    }
                }
                Action::SendTerminateToAgent => {
                    if let Some(pid) = self.supervisor.agent_pid {
                        send_signal(pid, nix::sys::signal::Signal::SIGTERM);
                    }
                }
                Action::SendTerminateToWatchdog(pid) => {
                    send_signal(pid, nix::sys::signal::Signal::SIGTERM);
                }
            }
        }
    }

    /// Runs the event loop until the agent exits. `rpc_conns` is a channel
    /// receiver fed by a dedicated accept-loop thread so the loop itself
    /// stays single-threaded and easy to reason about (§5). The agent's
    /// stderr and exit channels don't exist until `start` triggers bring-up,
    /// so they start out as `never()` and get swapped in once `apply_actions`
    /// notices `self.pending_agent_streams` has been populated.
    pub fn run_event_loop(&mut self, rpc_conns: &Receiver<UnixStream>) {
        let mut agent_lines: Receiver<String> = crossbeam_channel::never();
        let mut agent_exited: Receiver<()> = crossbeam_channel::never();

        loop {
            crossbeam_channel::select! {
                recv(rpc_conns) -> conn => {
                    if let Ok(mut stream) = conn {
                        if let Err(e) = rpcserver::serve_connection(&mut stream, self) {
                            warn!("rpc connection error: {e:?}");
                        }
                    }
                    if let Some((lines, exited)) = self.pending_agent_streams.take() {
                        agent_lines = lines;
                        agent_exited = exited;
                    }
                }
                recv(agent_lines) -> line => {
                    match line {
                        Ok(line) => {
                            if line.starts_with("Error:") {
                                error!("agent: {line}");
                            } else if line.starts_with("Warning:") {
                                warn!("agent: {line}");
                            }
                            let actions = self.supervisor.handle_line(&line);
                            self.apply_actions(actions);
                        }
                        Err(_) => continue,
                    }
                }
                recv(agent_exited) -> _ => {
                    info!("agent exited, node daemon shutting down");
                    if let Some(mut child) = self.agent_child.take() {
                        let _ = child.wait();
                    }
                    return;
                }
            }
        }
    }
}

impl rpcserver::RpcHandler for NodeDaemon {
    /// Handles the broker's `start` call: triggers bring-up if the session
    /// is still fresh, then returns immediately, well before the agent
    /// reaches `waiting` (the broker polls the record file for that).
    fn start(&mut self, _params: ParamMap) -> Result<Value, RpcError> {
        if self.supervisor.session.state != SessionState::Created {
            return Err(RpcError::InvalidSessionState(format!(
                "session is already {:?}",
                self.supervisor.session.state
            )));
        }
        self.bring_up().map_err(|e| RpcError::Generic(e.to_string()))?;
        Ok(serde_json::json!({ "display": self.supervisor.session.display }))
    }

    /// Handles `attach`. For a freshly created shadow session this is its
    /// `start` analogue: the broker already fetched the target's shadow
    /// cookie, so bring-up records it alongside the target's display
    /// number (looked up from the target's own record by its `id`
    /// parameter) before spawning the agent with `-shadow host:display`.
    /// For a session that has already been brought up, `attach` resumes it
    /// exactly like `restore` (an already-attached shadow target, etc).
    fn attach(&mut self, args: AttachArgs) -> Result<Value, RpcError> {
        if self.supervisor.session.state == SessionState::Created && self.supervisor.session.session_type.is_shadow()
        {
            let shadow_cookie =
                args.shadow_cookie.ok_or_else(|| RpcError::SessionParameter("shadowcookie".to_string()))?;
            let target_id = args.params.get("id").ok_or_else(|| RpcError::SessionParameter("id".to_string()))?;
            let target = self
                .store
                .load_session(target_id)
                .map_err(|e| RpcError::Generic(e.to_string()))?
                .ok_or_else(|| RpcError::NotFound(format!("no session {target_id}")))?;

            self.supervisor.session.shadow_display = Some(target.display);
            self.supervisor.session.shadow_cookie = Some(shadow_cookie);
            self.bring_up().map_err(|e| RpcError::Generic(e.to_string()))?;
            return Ok(serde_json::json!({ "display": self.supervisor.session.display }));
        }

        let actions = self.supervisor.restore();
        self.apply_actions(actions);
        Ok(serde_json::json!({ "display": self.supervisor.session.display }))
    }

    fn restore(&mut self, _params: ParamMap) -> Result<Value, RpcError> {
        let actions = self.supervisor.restore();
        self.apply_actions(actions);
        Ok(serde_json::json!({ "display": self.supervisor.session.display }))
    }

    fn terminate(&mut self) -> Result<Value, RpcError> {
        let actions = self.supervisor.terminate();
        self.apply_actions(actions);
        Ok(Value::Null)
    }

    fn get_shadow_cookie(&mut self) -> Result<Value, RpcError> {
        self.supervisor
            .session
            .shadow_cookie
            .clone()
            .map(Value::String)
            .ok_or_else(|| RpcError::NotFound("session has no shadow cookie".to_string()))
    }
}

/// Spawns a thread that reads lines from `reader` and forwards them on a
/// channel, closing it (and sending an exit notification) on EOF.
pub fn spawn_line_reader(reader: impl std::io::Read + Send + 'static) -> (Receiver<String>, Receiver<()>) {
    let (line_tx, line_rx): (Sender<String>, Receiver<String>) = bounded(64);
    let (exit_tx, exit_rx) = bounded(1);
    std::thread::spawn(move || {
        let buffered = BufReader::new(reader);
        for line in buffered.lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = exit_tx.send(());
    });
    (line_rx, exit_rx)
}

fn run_xauth_add(xauth_path: &Path, auth_file: &Path, display_spec: &str, cookie: &str) -> anyhow::Result<()> {
    let status = Command::new(xauth_path)
        .arg("-f")
        .arg(auth_file)
        .arg("add")
        .arg(display_spec)
        .arg(".")
        .arg(cookie)
        .status()
        .with_context(|| format!("running xauth add for {display_spec}"))?;

    if !status.success() {
        anyhow::bail!("xauth add for {display_spec} exited with {status}");
    }
    Ok(())
}

fn send_signal(pid: i32, signal: nix::sys::signal::Signal) {
    if let Err(e) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal) {
        warn!("failed to send {signal} to pid {pid}: {e}");
    }
}

/// Reads the `Language` key from `~/.dmrc`'s `[Desktop]` section, if
/// present (§4.5 bring-up step 4).
fn dmrc_language(home_dir: &str) -> Option<String> {
    let path = Path::new(home_dir).join(".dmrc");
    let content = std::fs::read_to_string(path).ok()?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("Language=").map(str::trim).map(str::to_string))
}

use std::os::unix::process::CommandExt as _;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dmrc_language_reads_the_key_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".dmrc"), "[Desktop]\nLayout=Default\nLanguage=en_GB.UTF-8\n").unwrap();
        assert_eq!(dmrc_language(dir.path().to_str().unwrap()), Some("en_GB.UTF-8".to_string()));
    }

    #[test]
    fn dmrc_language_is_none_when_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(dmrc_language(dir.path().to_str().unwrap()), None);
    }
}
