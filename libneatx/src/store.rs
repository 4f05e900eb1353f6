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

//! The session record and the directory-of-directories store it lives in
//! (§3, §4.2). One subdirectory per session id holds the JSON record plus
//! everything else the node daemon writes for that session (Xauthority
//! blob, options file, log, RPC socket).

use std::fs;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};

use rand::RngCore;
use serde_derive::{Deserialize, Serialize};

use crate::consts;
use crate::errors::InvalidSessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Starting,
    Waiting,
    Running,
    Suspending,
    Suspended,
    Terminating,
    Terminated,
}

impl SessionState {
    /// Maps the server-internal state to the client-visible status word
    /// the `listsession` table renders, collapsing the two "in transit to
    /// a terminal state" states into their destination (§4.4, scenario 4).
    pub fn client_status(self) -> &'static str {
        match self {
            SessionState::Created => "Created",
            SessionState::Starting => "Starting",
            SessionState::Waiting => "Waiting",
            SessionState::Running => "Running",
            SessionState::Suspending | SessionState::Suspended => "Suspended",
            SessionState::Terminating | SessionState::Terminated => "Terminated",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidSessionState> {
        match s {
            "created" => Ok(SessionState::Created),
            "starting" => Ok(SessionState::Starting),
            "waiting" => Ok(SessionState::Waiting),
            "running" => Ok(SessionState::Running),
            "suspending" => Ok(SessionState::Suspending),
            "suspended" => Ok(SessionState::Suspended),
            "terminating" => Ok(SessionState::Terminating),
            "terminated" => Ok(SessionState::Terminated),
            other => Err(InvalidSessionState(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Starting => "starting",
            SessionState::Waiting => "waiting",
            SessionState::Running => "running",
            SessionState::Suspending => "suspending",
            SessionState::Suspended => "suspended",
            SessionState::Terminating => "terminating",
            SessionState::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    #[serde(rename = "unix-application")]
    Application,
    #[serde(rename = "unix-cde")]
    Cde,
    #[serde(rename = "unix-console")]
    Console,
    #[serde(rename = "unix-gnome")]
    Gnome,
    #[serde(rename = "unix-kde")]
    Kde,
    #[serde(rename = "unix-xdm")]
    Xdm,
    #[serde(rename = "shadow")]
    Shadow,
}

impl SessionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionType::Application => "unix-application",
            SessionType::Cde => "unix-cde",
            SessionType::Console => "unix-console",
            SessionType::Gnome => "unix-gnome",
            SessionType::Kde => "unix-kde",
            SessionType::Xdm => "unix-xdm",
            SessionType::Shadow => "shadow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unix-application" => Some(SessionType::Application),
            "unix-cde" => Some(SessionType::Cde),
            "unix-console" => Some(SessionType::Console),
            "unix-gnome" => Some(SessionType::Gnome),
            "unix-kde" => Some(SessionType::Kde),
            "unix-xdm" => Some(SessionType::Xdm),
            "shadow" => Some(SessionType::Shadow),
            _ => None,
        }
    }

    pub fn is_shadow(self) -> bool {
        matches!(self, SessionType::Shadow)
    }
}

/// The authoritative shared entity (§3). Mutated only by the node daemon
/// that owns it; read by the broker and by the daemon itself on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub hostname: String,
    pub display: u32,
    pub port: Option<u16>,
    pub username: String,
    pub cookie: String,
    pub state: SessionState,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub name: String,

    pub geometry: String,
    pub screeninfo: String,
    pub keyboard: String,
    pub link: String,
    pub client: String,
    pub cache: i64,
    pub images: i64,
    pub fullscreen: bool,
    pub rootless: bool,
    pub virtualdesktop: bool,
    pub resize: bool,

    pub ssl: bool,
    pub subscription: String,

    #[serde(default)]
    pub shadow_display: Option<u32>,
    #[serde(default)]
    pub shadow_cookie: Option<String>,

    #[serde(rename = "_updated", default)]
    pub updated: String,
}

impl Session {
    pub fn full_id(&self) -> String {
        format!("{}-{}-{}", self.hostname, self.display, self.id)
    }

    pub fn windowname(&self) -> String {
        format!(
            "Neatx - {}@{}:{} - {}",
            self.username, self.hostname, self.display, self.name
        )
    }

    /// Validated state assignment (§8: "for all state ∉ VALID_STATES,
    /// assignment fails"). With `SessionState` as a closed enum this is
    /// infallible for in-process callers, but the wire boundary (RPC
    /// deserialization, the options file) goes through string form first,
    /// so `SessionState::parse` is the actual enforcement point; this
    /// method exists to give state transitions a single call site to
    /// instrument with logging and record persistence hooks.
    pub fn set_state(&mut self, new: SessionState) {
        self.state = new;
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Generates a new session id: the uppercase hex MD5 digest of a random
/// 1024-bit draw, matching the source's `NewUniqueId`.
fn new_unique_id() -> String {
    let mut bytes = [0u8; 128];
    rand::thread_rng().fill_bytes(&mut bytes);
    let digest = md5::Md5::digest(bytes);
    hex::encode_upper(digest)
}

use md5::Digest as _;

/// Generates a fresh Xauth cookie: 16 random bytes as lowercase hex,
/// matching the conventional `xauth` cookie width.
pub fn new_cookie() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SessionStore { root: root.into() }
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn data_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join(consts::SESSION_DATA_FILE_NAME)
    }

    pub fn socket_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join(consts::NODE_SOCKET_NAME)
    }

    pub fn options_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join(consts::SESSION_OPTIONS_FILE_NAME)
    }

    pub fn authority_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join(consts::SESSION_AUTHORITY_FILE_NAME)
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join(consts::SESSION_LOG_FILE_NAME)
    }

    /// Generates a fresh id and creates its (empty, mode 0700) directory
    /// atomically, retrying on collision up to
    /// [`consts::SESSION_ID_CREATE_RETRIES`] times.
    pub fn create_session_id(&self) -> anyhow::Result<String> {
        fs::create_dir_all(&self.root)?;

        for _ in 0..consts::SESSION_ID_CREATE_RETRIES {
            let id = new_unique_id();
            let dir = self.session_dir(&id);
            match fs::DirBuilder::new().mode(0o700).create(&dir) {
                Ok(()) => return Ok(id),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e).map_err(anyhow::Error::from),
            }
        }

        anyhow::bail!(
            "could not allocate a unique session id after {} attempts",
            consts::SESSION_ID_CREATE_RETRIES
        )
    }

    /// Serializes `sess`, refreshing `_updated`, and writes it via
    /// temp-file-and-rename so concurrent readers never observe a partial
    /// file (§4.2).
    pub fn save_session(&self, sess: &mut Session) -> anyhow::Result<()> {
        sess.updated = now_rfc3339();

        let dir = self.session_dir(&sess.id);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, sess)?;
        tmp.persist(self.data_path(&sess.id))?;
        Ok(())
    }

    /// Returns the record for `id`, or `None` if it doesn't exist or
    /// isn't readable by us (both are normal conditions, not errors:
    /// §4.2).
    pub fn load_session(&self, id: &str) -> anyhow::Result<Option<Session>> {
        match fs::read(self.data_path(id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e)
                if e.kind() == std::io::ErrorKind::NotFound
                    || e.kind() == std::io::ErrorKind::PermissionDenied =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Same as [`Self::load_session`], but returns `None` if the record
    /// belongs to a different user.
    pub fn load_session_for_user(&self, id: &str, user: &str) -> anyhow::Result<Option<Session>> {
        Ok(self.load_session(id)?.filter(|s| s.username == user))
    }

    /// Scans every visible session subdirectory owned by `user`, loading
    /// each and keeping those `predicate` accepts. Tolerates directories
    /// that disappear mid-scan and any entry that fails to load as a
    /// session record (a stray file, a half-created directory).
    pub fn find_sessions_with_filter(
        &self,
        user: &str,
        mut predicate: impl FnMut(&Session) -> bool,
    ) -> anyhow::Result<Vec<Session>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut result = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let Ok(file_type) = entry.file_type() else { continue };
            if !file_type.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_string) else { continue };

            let Ok(Some(sess)) = self.load_session(&id) else { continue };
            if sess.username == user && predicate(&sess) {
                result.push(sess);
            }
        }

        Ok(result)
    }
}

/// Returns whether `path`'s owning uid matches `uid` (used when an
/// explicit ownership check is cheaper than trusting filesystem
/// permissions alone).
pub fn owned_by(path: &Path, uid: u32) -> bool {
    fs::metadata(path).map(|m| m.uid() == uid).unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    fn sample_session(id: &str, username: &str) -> Session {
        Session {
            id: id.to_string(),
            hostname: "nxhost".to_string(),
            display: 42,
            port: None,
            username: username.to_string(),
            cookie: "c0ffee".to_string(),
            state: SessionState::Created,
            session_type: SessionType::Gnome,
            name: "test session".to_string(),
            geometry: "1024x768".to_string(),
            screeninfo: "1024x768x24".to_string(),
            keyboard: "pc105/gb".to_string(),
            link: "isdn".to_string(),
            client: "unknown".to_string(),
            cache: 16,
            images: 64,
            fullscreen: false,
            rootless: false,
            virtualdesktop: true,
            resize: false,
            ssl: true,
            subscription: consts::DEFAULT_SUBSCRIPTION.to_string(),
            shadow_display: None,
            shadow_cookie: None,
            updated: String::new(),
        }
    }

    #[test]
    fn full_id_and_windowname() {
        let sess = sample_session("ABCDEF", "alice");
        assert_eq!(sess.full_id(), "nxhost-42-ABCDEF");
        assert_eq!(sess.windowname(), "Neatx - alice@nxhost:42 - test session");
    }

    #[test]
    fn session_state_rejects_unknown_strings() {
        assert!(SessionState::parse("bogus").is_err());
        for s in
            ["created", "starting", "waiting", "running", "suspending", "suspended", "terminating", "terminated"]
        {
            assert!(SessionState::parse(s).is_ok());
        }
    }

    #[test]
    fn status_mapping_collapses_transitional_states() {
        assert_eq!(SessionState::Terminating.client_status(), "Terminated");
        assert_eq!(SessionState::Suspending.client_status(), "Suspended");
        assert_eq!(SessionState::Waiting.client_status(), "Waiting");
    }

    #[test]
    fn save_then_load_round_trips_field_by_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let id = store.create_session_id().unwrap();

        let mut sess = sample_session(&id, "alice");
        store.save_session(&mut sess).unwrap();

        let loaded = store.load_session(&id).unwrap().expect("session should load");
        assert_eq!(loaded.id, sess.id);
        assert_eq!(loaded.hostname, sess.hostname);
        assert_eq!(loaded.display, sess.display);
        assert_eq!(loaded.username, sess.username);
        assert_eq!(loaded.state, sess.state);
        assert!(!loaded.updated.is_empty());
    }

    #[test]
    fn load_missing_session_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(store.load_session("DOESNOTEXIST").unwrap().is_none());
    }

    #[test]
    fn load_for_wrong_user_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let id = store.create_session_id().unwrap();
        let mut sess = sample_session(&id, "alice");
        store.save_session(&mut sess).unwrap();

        assert!(store.load_session_for_user(&id, "mallory").unwrap().is_none());
        assert!(store.load_session_for_user(&id, "alice").unwrap().is_some());
    }

    #[test]
    fn find_sessions_with_filter_matches_owner_and_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let id_a = store.create_session_id().unwrap();
        let mut sess_a = sample_session(&id_a, "alice");
        sess_a.state = SessionState::Running;
        store.save_session(&mut sess_a).unwrap();

        let id_b = store.create_session_id().unwrap();
        let mut sess_b = sample_session(&id_b, "alice");
        sess_b.state = SessionState::Terminated;
        store.save_session(&mut sess_b).unwrap();

        let id_c = store.create_session_id().unwrap();
        let mut sess_c = sample_session(&id_c, "bob");
        sess_c.state = SessionState::Running;
        store.save_session(&mut sess_c).unwrap();

        let running_for_alice = store
            .find_sessions_with_filter("alice", |s| s.state == SessionState::Running)
            .unwrap();
        assert_eq!(running_for_alice.len(), 1);
        assert_eq!(running_for_alice[0].id, id_a);
    }

    #[test]
    fn new_cookie_is_32_lowercase_hex_chars() {
        let cookie = new_cookie();
        assert_eq!(cookie.len(), 32);
        assert!(cookie.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn session_id_generation_is_unique_and_well_formed() {
        let mut seen = HashSet::new();
        for _ in 0..256 {
            let id = new_unique_id();
            assert_eq!(id.len(), 32);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
            assert!(seen.insert(id), "generated a duplicate session id");
        }
    }
}
