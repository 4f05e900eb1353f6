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

//! The per-user session broker (§4.4): runs as the authenticated user,
//! serving `listsession`/`startsession`/`attachsession`/`restoresession`
//! over the client transport it inherited from the front-end.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use neatx_protocol::nxline;
use neatx_protocol::rpc::{self, AttachArgs, Command as RpcCommand, ParamMap, Request, Response, RpcError};

use crate::consts;
use crate::daemon::display;
use crate::errors::{SessionNotReadyError, SessionParameterError};
use crate::retry::{self, Clock, Step};
use crate::store::{Session, SessionState, SessionStore, SessionType};

const DEFAULT_DEPTH: u32 = 24;

/// Columns rendered by `listsession`: (header, width; negative = right
/// aligned), matching the column set and widths of the original
/// `LISTSESSION_COLUMNS` table.
const LISTSESSION_COLUMNS: &[(&str, i32)] = &[
    ("Display", 7),
    ("Type", 16),
    ("Session ID", 32),
    ("Options", 8),
    ("Depth", -5),
    ("Screen", 14),
    ("Status", 11),
    ("Session Name", 30),
];

/// The eight-character options flag string: fullscreen, render,
/// virtual-desktop, three reserved dashes, then the fixed `P`, `S`, `A`
/// suffix (§4.4, §8 scenario 3).
pub fn format_options(sess: &Session) -> String {
    let mut flags = String::with_capacity(8);
    flags.push(if sess.fullscreen { 'F' } else { '-' });
    flags.push(if sess.screeninfo.contains("render") { 'R' } else { '-' });
    flags.push(if sess.virtualdesktop { 'D' } else { '-' });
    flags.push_str("--");
    flags.push_str("PSA");
    flags
}

/// The geometry truncated at its first `+` (§4.4, §8 scenario 4).
pub fn format_screen(sess: &Session) -> String {
    if sess.geometry.is_empty() {
        return "-".to_string();
    }
    match sess.geometry.find('+') {
        Some(pos) => sess.geometry[..pos].to_string(),
        None => sess.geometry.clone(),
    }
}

/// One row of rendered column values, in [`LISTSESSION_COLUMNS`] order.
fn row_values(sess: &Session) -> Vec<String> {
    vec![
        sess.display.to_string(),
        sess.session_type.as_str().to_string(),
        sess.id.clone(),
        format_options(sess),
        DEFAULT_DEPTH.to_string(),
        format_screen(sess),
        sess.state.client_status().to_string(),
        sess.name.clone(),
    ]
}

/// Formats a header, a dashes separator, and one row per session, using
/// fixed column widths with the last column left unpadded (mirrors the
/// source's generic `FormatTable`).
pub fn render_listsession_table(sessions: &[Session]) -> Vec<String> {
    let mut lines = Vec::with_capacity(sessions.len() + 2);

    let pad = |s: &str, width: i32, is_last: bool| -> String {
        if is_last && width >= 0 {
            return s.to_string();
        }
        let w = width.unsigned_abs() as usize;
        if width < 0 {
            format!("{s:>w$}")
        } else {
            format!("{s:<w$}")
        }
    };

    let header: Vec<String> = LISTSESSION_COLUMNS
        .iter()
        .enumerate()
        .map(|(idx, (name, width))| pad(name, *width, idx == LISTSESSION_COLUMNS.len() - 1))
        .collect();
    lines.push(header.join(" ").trim_end().to_string());

    let dashes: Vec<String> = LISTSESSION_COLUMNS
        .iter()
        .enumerate()
        .map(|(idx, (name, width))| pad(&"-".repeat(name.len().max(width.unsigned_abs() as usize)), *width, idx == LISTSESSION_COLUMNS.len() - 1))
        .collect();
    lines.push(dashes.join(" ").trim_end().to_string());

    for sess in sessions {
        let values = row_values(sess);
        let row: Vec<String> = values
            .iter()
            .zip(LISTSESSION_COLUMNS)
            .enumerate()
            .map(|(idx, (value, (_, width)))| pad(value, *width, idx == LISTSESSION_COLUMNS.len() - 1))
            .collect();
        lines.push(row.join(" ").trim_end().to_string());
    }

    lines
}

/// The session-info block sent after `startsession`/`restoresession`/
/// `attachsession` succeed, grounded in `GetClientSessionInfo`: each line
/// carries its own status code, terminated by code 710.
pub fn session_info_lines(sess: &Session) -> Vec<(u16, String)> {
    let session_cache = if sess.session_type.as_str().starts_with("unix-") {
        sess.session_type.as_str().to_string()
    } else {
        format!("unix-{}", sess.session_type.as_str())
    };

    vec![
        (700, format!("Session id: {}", sess.full_id())),
        (705, format!("Session display: {}", sess.display)),
        (703, format!("Session type: {}", sess.session_type.as_str())),
        (701, format!("Proxy cookie: {}", sess.cookie)),
        (706, format!("Agent cookie: {}", sess.cookie)),
        (704, format!("Session cache: {session_cache}")),
        (728, format!("Session caption: {}", sess.windowname())),
        (707, format!("SSL tunneling: {}", nxline::format_nx_boolean(sess.ssl))),
        (708, format!("Subscription: {}", sess.subscription)),
        (710, "Session status: running".to_string()),
    ]
}

pub fn write_session_info(writer: &mut impl Write, sess: &Session) -> anyhow::Result<()> {
    for (code, message) in session_info_lines(sess) {
        write!(writer, "{}", nxline::format_prompt(code, Some(&message)))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_listsession(writer: &mut impl Write, username: &str, sessions: &[Session]) -> anyhow::Result<()> {
    write!(writer, "{}", nxline::format_prompt(127, Some(&format!("Session list of user '{username}':"))))?;
    for line in render_listsession_table(sessions) {
        writeln!(writer, "{line}")?;
    }
    write!(
        writer,
        "{}",
        nxline::format_prompt(148, Some(&format!("Server capacity: not reached for user: {username}")))
    )?;
    writer.flush()?;
    Ok(())
}

/// Builds the `listsession` predicate from parsed parameters (§4.4): a
/// `type=shadow` request switches to selecting running sessions of any
/// type instead of filtering by type; otherwise `type` and `status` are
/// independent comma-separated allowlists, each applied only when present.
pub fn listsession_filter(params: &[(String, String)]) -> impl Fn(&Session) -> bool {
    let types = get_param(params, "type").map(|v| v.split(',').map(str::to_string).collect::<Vec<_>>());
    let want_shadow = types.as_ref().and_then(|t| t.first()).map(|t| t == "shadow").unwrap_or(false);

    let type_filter: Option<Vec<SessionType>> =
        if want_shadow { None } else { types.map(|t| t.iter().filter_map(|s| SessionType::parse(s)).collect()) };

    let status_filter: Option<Vec<SessionState>> = if want_shadow {
        Some(vec![SessionState::Running])
    } else {
        get_param(params, "status").map(|v| v.split(',').filter_map(|s| SessionState::parse(s).ok()).collect())
    };

    move |sess: &Session| {
        if let Some(types) = &type_filter {
            if !types.contains(&sess.session_type) {
                return false;
            }
        }
        if let Some(states) = &status_filter {
            if !states.contains(&sess.state) {
                return false;
            }
        }
        true
    }
}

/// Connects to a session's RPC socket with the connect-retry backoff
/// (§4.4): starts at 100ms, grows ×1.1, 10s budget, retrying only on
/// `NotFound`/`ConnectionRefused`.
pub fn connect_with_retry(clock: &dyn Clock, socket_path: &std::path::Path) -> anyhow::Result<UnixStream> {
    retry::connect_retry(clock, || match UnixStream::connect(socket_path) {
        Ok(stream) => Ok(Step::Done(stream)),
        Err(e)
            if e.kind() == std::io::ErrorKind::NotFound || e.kind() == std::io::ErrorKind::ConnectionRefused =>
        {
            Ok(Step::Retry)
        }
        Err(e) => Err(e.into()),
    })
}

/// Issues `cmd` with `args` over `stream` and returns the decoded typed
/// result, converting a failure response into an [`RpcError`].
pub fn call(stream: &mut UnixStream, cmd: RpcCommand, args: serde_json::Value) -> Result<serde_json::Value, RpcError> {
    let req = Request::new(cmd, args);
    rpc::encode_to(stream, &req).map_err(|e| RpcError::Generic(e.to_string()))?;
    let resp: Response = rpc::decode_from(stream)
        .map_err(|e| RpcError::Generic(e.to_string()))?
        .ok_or_else(|| RpcError::Generic("node daemon closed the connection".to_string()))?;

    if resp.success {
        Ok(resp.result)
    } else {
        Err(RpcError::from_wire(&resp.result))
    }
}

/// Polls the session record until it leaves `created`/`starting` for
/// `waiting` (success) or `terminating`/`terminated` (failure), using the
/// readiness-poll backoff (100ms start, ×1.5 growth, 1s cap, caller
/// supplied budget).
pub fn wait_for_ready(
    clock: &dyn Clock,
    budget: Duration,
    mut load: impl FnMut() -> anyhow::Result<Option<Session>>,
) -> anyhow::Result<Session> {
    retry::readiness_retry(clock, budget, || {
        let sess = load()?.ok_or_else(|| anyhow::anyhow!("session record disappeared while waiting"))?;
        match sess.state {
            SessionState::Waiting | SessionState::Running | SessionState::Suspended => Ok(Step::Done(sess)),
            SessionState::Terminating | SessionState::Terminated => {
                anyhow::bail!("session entered {:?} before becoming ready", sess.state)
            }
            _ => Ok(Step::Retry),
        }
    })
}

/// Spawns the node daemon wrapper for a freshly allocated session and
/// returns its pid without waiting on it (it double-forks itself).
pub fn spawn_node_daemon(neatx_bin: &std::path::Path, username: &str, session_id: &str) -> anyhow::Result<()> {
    Command::new(neatx_bin)
        .arg("node-daemon")
        .arg(username)
        .arg(session_id)
        .spawn()
        .map_err(anyhow::Error::from)?;
    Ok(())
}

/// After the command loop returns, relays bytes between the client
/// transport and `localhost:<port>` via the external data-relay binary,
/// blocking until it exits (§4.4, "After the command loop returns").
pub fn spawn_data_relay(relay_bin: &std::path::Path, port: u16) -> anyhow::Result<std::process::ExitStatus> {
    Command::new(relay_bin)
        .arg(format!("localhost:{port}"))
        .status()
        .map_err(anyhow::Error::from)
}

pub const START_READY_BUDGET: Duration = consts::READY_RETRY_BUDGET_START;
pub const RESTORE_READY_BUDGET: Duration = consts::READY_RETRY_BUDGET_RESTORE;

/// Converts a parsed `--name="value"` parameter list into the map sent as
/// `start`/`restore`'s RPC args.
pub fn params_to_map(params: &[(String, String)]) -> ParamMap {
    params.iter().map(|(k, v)| (k.clone(), nxline::unquote_value(v))).collect()
}

pub fn attach_args(params: &[(String, String)], shadow_cookie: Option<String>) -> AttachArgs {
    AttachArgs { params: params_to_map(params), shadow_cookie }
}

fn get_param(params: &[(String, String)], key: &str) -> Option<String> {
    params.iter().find(|(k, _)| k == key).map(|(_, v)| nxline::unquote_value(v))
}

/// Builds a fresh session record from `startsession`'s parsed parameters,
/// allocating a display and a fresh Xauth cookie. `type` is the only
/// parameter with no sensible default: everything else falls back to a
/// plain desktop session (§4.4, §7 kind 4 for the one that's missing).
fn session_from_params(
    username: &str,
    hostname: &str,
    id: String,
    params: &[(String, String)],
) -> anyhow::Result<Session> {
    let get_or = |key: &str, default: &str| get_param(params, key).unwrap_or_else(|| default.to_string());
    let get_bool = |key: &str, default: bool| {
        get_param(params, key).map(|v| nxline::parse_nx_boolean(&v)).unwrap_or(default)
    };
    let get_size = |key: &str, default: i64| {
        get_param(params, key).and_then(|v| nxline::parse_nx_size(&v)).unwrap_or(default)
    };

    let session_type = get_param(params, "type")
        .as_deref()
        .and_then(SessionType::parse)
        .ok_or_else(|| SessionParameterError("type".to_string()))?;

    Ok(Session {
        id,
        hostname: hostname.to_string(),
        display: display::find_unused_display()?,
        port: None,
        username: username.to_string(),
        cookie: crate::store::new_cookie(),
        state: SessionState::Created,
        session_type,
        name: get_or("session", "default"),
        geometry: get_or("geometry", "640x480"),
        screeninfo: get_or("screeninfo", "1024x768x24"),
        keyboard: get_or("keyboard", "pc105/gb"),
        link: get_or("link", "isdn"),
        client: get_or("client", "unknown"),
        cache: get_size("cache", 16),
        images: get_size("images", 64),
        fullscreen: get_bool("fullscreen", false),
        rootless: get_bool("rootless", false),
        virtualdesktop: get_bool("virtualdesktop", true),
        resize: get_bool("resize", false),
        ssl: get_bool("encryption", true),
        subscription: consts::DEFAULT_SUBSCRIPTION.to_string(),
        shadow_display: None,
        shadow_cookie: None,
        updated: String::new(),
    })
}

/// Handles `startsession` end to end (§4.4): allocates a session id and
/// record, spawns the node daemon, hands it the go-ahead over its RPC
/// socket, then polls the record until the agent reports it's ready for
/// a client to connect.
pub fn start_session(
    store: &SessionStore,
    clock: &dyn Clock,
    neatx_bin: &Path,
    username: &str,
    hostname: &str,
    params: &[(String, String)],
) -> anyhow::Result<Session> {
    let id = store.create_session_id()?;
    let mut sess = session_from_params(username, hostname, id.clone(), params)?;
    store.save_session(&mut sess)?;

    spawn_node_daemon(neatx_bin, username, &id)?;

    let mut stream = connect_with_retry(clock, &store.socket_path(&id))?;
    call(&mut stream, RpcCommand::Start, serde_json::to_value(params_to_map(params))?)?;

    wait_for_ready(clock, START_READY_BUDGET, || store.load_session(&id))
}

/// Handles `attachsession` (§4.4): same shape as `start_session`, with the
/// addition that the broker first dials the *target* session (named by
/// `id`) and asks its node daemon for a shadow cookie, which is then
/// handed to the freshly spawned shadow session's `attach` RPC.
pub fn attach_session(
    store: &SessionStore,
    clock: &dyn Clock,
    neatx_bin: &Path,
    username: &str,
    hostname: &str,
    params: &[(String, String)],
) -> anyhow::Result<Session> {
    let target_id = get_param(params, "id").ok_or_else(|| SessionParameterError("id".to_string()))?;
    store
        .load_session_for_user(&target_id, username)?
        .ok_or_else(|| SessionNotReadyError(format!("no session {target_id} owned by {username}")))?;

    let mut target_stream = UnixStream::connect(store.socket_path(&target_id))
        .map_err(|e| SessionNotReadyError(format!("connecting to session {target_id}: {e}")))?;
    let cookie_value = call(&mut target_stream, RpcCommand::GetShadowCookie, serde_json::Value::Null)?;
    let shadow_cookie: String = serde_json::from_value(cookie_value)?;

    let id = store.create_session_id()?;
    let mut sess = session_from_params(username, hostname, id.clone(), params)?;
    store.save_session(&mut sess)?;

    spawn_node_daemon(neatx_bin, username, &id)?;

    let mut stream = connect_with_retry(clock, &store.socket_path(&id))?;
    let args = attach_args(params, Some(shadow_cookie));
    call(&mut stream, RpcCommand::Attach, serde_json::to_value(args)?)?;

    wait_for_ready(clock, START_READY_BUDGET, || store.load_session(&id))
}

/// Handles `restoresession` (§4.4): resumes a suspended session named by
/// its `id` parameter. The target session already exists, so a missing
/// socket is fatal rather than transient — no connect-retry loop.
pub fn restore_session(
    store: &SessionStore,
    clock: &dyn Clock,
    username: &str,
    params: &[(String, String)],
) -> anyhow::Result<Session> {
    let id = get_param(params, "id").ok_or_else(|| SessionParameterError("id".to_string()))?;
    store
        .load_session_for_user(&id, username)?
        .ok_or_else(|| SessionNotReadyError(format!("no session {id} owned by {username}")))?;

    let mut stream = UnixStream::connect(store.socket_path(&id))
        .map_err(|e| SessionNotReadyError(format!("connecting to session {id}: {e}")))?;
    call(&mut stream, RpcCommand::Restore, serde_json::to_value(params_to_map(params))?)?;

    wait_for_ready(clock, RESTORE_READY_BUDGET, || store.load_session(&id))
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Session {
        Session {
            id: "0123456789ABCDEF0123456789ABCDEF".chars().take(32).collect(),
            hostname: "nxhost".to_string(),
            display: 1042,
            port: Some(5042),
            username: "alice".to_string(),
            cookie: "cafebabe".to_string(),
            state: SessionState::Terminating,
            session_type: SessionType::Gnome,
            name: "My Session".to_string(),
            geometry: "1024x768+0+0".to_string(),
            screeninfo: "1024x768x24+render".to_string(),
            keyboard: "pc105/gb".to_string(),
            link: "isdn".to_string(),
            client: "unknown".to_string(),
            cache: 16,
            images: 64,
            fullscreen: true,
            rootless: false,
            virtualdesktop: true,
            resize: false,
            ssl: true,
            subscription: "GPL".to_string(),
            shadow_display: None,
            shadow_cookie: None,
            updated: String::new(),
        }
    }

    #[test]
    fn format_options_renders_eight_chars_with_fixed_suffix() {
        let sess = sample();
        assert_eq!(format_options(&sess), "FRD--PSA");
    }

    #[test]
    fn format_options_unset_flags_use_dashes() {
        let mut sess = sample();
        sess.fullscreen = false;
        sess.virtualdesktop = false;
        sess.screeninfo = "1024x768x24".to_string();
        assert_eq!(format_options(&sess), "-----PSA");
    }

    #[test]
    fn format_screen_truncates_at_first_plus() {
        let sess = sample();
        assert_eq!(format_screen(&sess), "1024x768");
    }

    #[test]
    fn format_screen_without_plus_is_unchanged() {
        let mut sess = sample();
        sess.geometry = "1024x768".to_string();
        assert_eq!(format_screen(&sess), "1024x768");
    }

    #[test]
    fn status_collapses_terminating_to_terminated() {
        let sess = sample();
        assert_eq!(sess.state.client_status(), "Terminated");
    }

    #[test]
    fn listsession_table_has_header_dashes_and_one_row_per_session() {
        let sessions = vec![sample()];
        let lines = render_listsession_table(&sessions);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Display"));
        assert!(lines[1].starts_with("-------"));
        assert!(lines[2].contains("My Session"));
    }

    #[test]
    fn write_listsession_emits_header_before_table_and_capacity_line() {
        let mut out = Vec::new();
        write_listsession(&mut out, "alice", &[sample()]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("NX> 127 Session list of user 'alice':"));
        assert!(text.contains("Display"));
        assert!(text.contains("148 Server capacity: not reached for user: alice"));
    }

    #[test]
    fn listsession_filter_with_no_params_accepts_everything() {
        let filter = listsession_filter(&[]);
        assert!(filter(&sample()));
    }

    #[test]
    fn listsession_filter_by_type_excludes_other_types() {
        let params = vec![("type".to_string(), "unix-kde".to_string())];
        let filter = listsession_filter(&params);
        assert!(!filter(&sample()));

        let mut kde = sample();
        kde.session_type = SessionType::Kde;
        assert!(filter(&kde));
    }

    #[test]
    fn listsession_filter_by_status_excludes_other_states() {
        let params = vec![("status".to_string(), "running".to_string())];
        let filter = listsession_filter(&params);
        assert!(!filter(&sample()));

        let mut running = sample();
        running.state = SessionState::Running;
        assert!(filter(&running));
    }

    #[test]
    fn listsession_filter_type_shadow_selects_running_sessions_of_any_type() {
        let params = vec![("type".to_string(), "shadow".to_string())];
        let filter = listsession_filter(&params);

        let mut running_gnome = sample();
        running_gnome.state = SessionState::Running;
        assert!(filter(&running_gnome));

        let mut waiting_gnome = sample();
        waiting_gnome.state = SessionState::Waiting;
        assert!(!filter(&waiting_gnome));
    }

    #[test]
    fn session_info_lines_end_with_code_710() {
        let sess = sample();
        let lines = session_info_lines(&sess);
        assert_eq!(lines.last().unwrap().0, 710);
        assert_eq!(lines[0].0, 700);
        assert!(lines[0].1.contains(&sess.full_id()));
    }

    #[test]
    fn params_to_map_percent_decodes_values() {
        let params = vec![("geometry".to_string(), "1024x768".to_string())];
        let map = params_to_map(&params);
        assert_eq!(map.get("geometry").unwrap(), "1024x768");
    }

    #[test]
    fn get_param_unquotes_the_matching_value() {
        let params = vec![("session".to_string(), "My%20Session".to_string())];
        assert_eq!(get_param(&params, "session").as_deref(), Some("My Session"));
        assert_eq!(get_param(&params, "missing"), None);
    }

    #[test]
    fn session_from_params_applies_defaults_for_omitted_fields() {
        let params = vec![("type".to_string(), "unix-gnome".to_string())];
        let sess = session_from_params("alice", "nxhost", "SESSIONID".to_string(), &params).unwrap();

        assert_eq!(sess.id, "SESSIONID");
        assert_eq!(sess.hostname, "nxhost");
        assert_eq!(sess.username, "alice");
        assert_eq!(sess.session_type, SessionType::Gnome);
        assert_eq!(sess.state, SessionState::Created);
        assert_eq!(sess.name, "default");
        assert_eq!(sess.geometry, "640x480");
        assert_eq!(sess.link, "isdn");
        assert!(sess.virtualdesktop);
        assert!(!sess.fullscreen);
        assert_eq!(sess.cache, 16);
        assert_eq!(sess.cookie.len(), 32);
    }

    #[test]
    fn session_from_params_honors_overrides() {
        let params = vec![
            ("type".to_string(), "unix-kde".to_string()),
            ("session".to_string(), "Work".to_string()),
            ("fullscreen".to_string(), "1".to_string()),
            ("cache".to_string(), "32M".to_string()),
        ];
        let sess = session_from_params("bob", "nxhost", "ID".to_string(), &params).unwrap();

        assert_eq!(sess.session_type, SessionType::Kde);
        assert_eq!(sess.name, "Work");
        assert!(sess.fullscreen);
        assert_eq!(sess.cache, 32);
    }

    #[test]
    fn session_from_params_requires_type() {
        let params = vec![("session".to_string(), "Work".to_string())];
        let err = session_from_params("bob", "nxhost", "ID".to_string(), &params).unwrap_err();
        assert!(err.downcast_ref::<SessionParameterError>().is_some());
    }
}
