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

//! The options file consumed by the display agent (§4.5 "Options file"):
//! a single comma-separated `name=value` line followed by `:<display>`.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::Context;

use crate::errors::IllegalCharacterError;
use crate::store::{Session, SessionType};

/// Builds the mandatory key set plus the session-type-conditional keys
/// (§4.5), in a deterministic order so the rendered line is stable across
/// runs and easy to diff in tests.
fn build_fields(sess: &Session) -> BTreeMap<&'static str, String> {
    let mut fields = BTreeMap::new();
    fields.insert("accept", "127.0.0.1".to_string());
    fields.insert("backingstore", "1".to_string());
    fields.insert("cache", sess.cache.to_string());
    fields.insert("cleanup", "0".to_string());
    fields.insert("client", sess.client.clone());
    fields.insert("clipboard", "both".to_string());
    fields.insert("composite", "1".to_string());
    fields.insert("cookie", sess.cookie.clone());
    fields.insert("id", sess.id.clone());
    fields.insert("images", sess.images.to_string());
    fields.insert("keyboard", sess.keyboard.clone());
    fields.insert("link", sess.link.clone());
    fields.insert("product", "neatx".to_string());
    let render = if sess.screeninfo.contains("render") { "1" } else { "0" };
    fields.insert("render", render.to_string());
    fields.insert("resize", if sess.resize { "1" } else { "0" }.to_string());
    fields.insert("shmem", "1".to_string());
    fields.insert("shpix", "1".to_string());
    fields.insert("strict", "0".to_string());
    fields.insert("type", sess.session_type.as_str().to_string());

    if sess.rootless {
        fields.insert("menu", "1".to_string());
        fields.insert("fullscreen", if sess.fullscreen { "1" } else { "0" }.to_string());
    } else {
        fields.insert("geometry", sess.geometry.clone());
    }

    if sess.session_type.is_shadow() {
        fields.insert("shadow", sess.shadow_display.map(|d| d.to_string()).unwrap_or_default());
        fields.insert("shadowuid", sess.username.clone());
        fields.insert("shadowmode", "1".to_string());
    }

    fields
}

/// Renders the options line and writes it atomically (temp-file-and-rename,
/// mode 0600). Fails with [`IllegalCharacterError`] if any value contains a
/// comma, which would corrupt the line's field separators.
pub fn write_options_file(path: &Path, sess: &Session) -> anyhow::Result<()> {
    let fields = build_fields(sess);

    for (key, value) in &fields {
        if value.contains(',') {
            return Err(IllegalCharacterError(format!("{key}={value}")).into());
        }
    }

    let pairs: Vec<String> = fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
    let line = format!("{}:{}\n", pairs.join(","), sess.display);

    let dir = path.parent().context("options path has no parent directory")?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write as _;
    tmp.write_all(line.as_bytes())?;
    tmp.as_file().set_permissions(std::fs::Permissions::from_mode(0o600))?;
    tmp.persist(path)?;
    Ok(())
}

/// The `DISPLAY` value handed to anything that should address the session
/// through its options file rather than by connecting directly: the
/// indirection form `nx/nx,options=<path>:<display>`.
pub fn display_env_var(options_path: &Path, display: u32) -> String {
    format!("nx/nx,options={}:{}", options_path.display(), display)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::SessionState;

    fn sample(session_type: SessionType, rootless: bool) -> Session {
        Session {
            id: "ID".to_string(),
            hostname: "host".to_string(),
            display: 42,
            port: None,
            username: "alice".to_string(),
            cookie: "cafebabe".to_string(),
            state: SessionState::Created,
            session_type,
            name: "desktop".to_string(),
            geometry: "1024x768".to_string(),
            screeninfo: "1024x768x24+render".to_string(),
            keyboard: "pc105/gb".to_string(),
            link: "isdn".to_string(),
            client: "unknown".to_string(),
            cache: 16,
            images: 64,
            fullscreen: false,
            rootless,
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
    fn desktop_session_gets_geometry_not_menu() {
        let sess = sample(SessionType::Gnome, false);
        let fields = build_fields(&sess);
        assert_eq!(fields.get("geometry"), Some(&"1024x768".to_string()));
        assert!(!fields.contains_key("menu"));
    }

    #[test]
    fn rootless_session_gets_menu_and_fullscreen_not_geometry() {
        let sess = sample(SessionType::Gnome, true);
        let fields = build_fields(&sess);
        assert!(!fields.contains_key("geometry"));
        assert_eq!(fields.get("menu"), Some(&"1".to_string()));
        assert_eq!(fields.get("fullscreen"), Some(&"0".to_string()));
    }

    #[test]
    fn shadow_session_gets_shadow_keys() {
        let mut sess = sample(SessionType::Shadow, false);
        sess.shadow_display = Some(7);
        let fields = build_fields(&sess);
        assert_eq!(fields.get("shadow"), Some(&"7".to_string()));
        assert_eq!(fields.get("shadowuid"), Some(&"alice".to_string()));
        assert_eq!(fields.get("shadowmode"), Some(&"1".to_string()));
    }

    #[test]
    fn render_flag_tracks_screeninfo_substring() {
        let sess = sample(SessionType::Gnome, false);
        assert_eq!(build_fields(&sess).get("render"), Some(&"1".to_string()));

        let mut plain = sample(SessionType::Gnome, false);
        plain.screeninfo = "1024x768x24".to_string();
        assert_eq!(build_fields(&plain).get("render"), Some(&"0".to_string()));
    }

    #[test]
    fn comma_in_value_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut sess = sample(SessionType::Gnome, false);
        sess.client = "bad,value".to_string();
        let err = write_options_file(&dir.path().join("options"), &sess).unwrap_err();
        assert!(err.to_string().contains("illegal character"));
    }

    #[test]
    fn writes_a_single_line_ending_with_display() {
        let dir = tempfile::tempdir().unwrap();
        let sess = sample(SessionType::Gnome, false);
        let path = dir.path().join("options");
        write_options_file(&path, &sess).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.trim_end().ends_with(":42"));
        assert!(content.contains("cookie=cafebabe"));

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn display_env_var_uses_indirection_form() {
        let path = Path::new("/var/lib/neatx/sessions/ABC/options");
        assert_eq!(
            display_env_var(path, 42),
            "nx/nx,options=/var/lib/neatx/sessions/ABC/options:42"
        );
    }
}
