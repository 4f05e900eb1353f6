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

//! Configuration file parsing, layered over hardcoded defaults the way the
//! teacher layers its own `config.toml`: every field is independently
//! optional so a sparse file only overrides what it mentions.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;

use crate::{consts, user};

/// Neatx's configuration file, normally at `~/.config/neatx/config.toml`
/// (or `/etc/neatx/neatx.conf` for the system-wide node daemon and
/// front-end) but overridable with `--config`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Protocol version the front-end advertises and requires of clients.
    /// Defaults to [`consts::DEFAULT_NX_PROTOCOL_VERSION`].
    pub protocol_version: Option<String>,

    /// Which authenticator to use: `"su"` or `"ssh"`. Defaults to `"su"`.
    pub auth_method: Option<String>,
    /// Target host for the `"ssh"` authenticator.
    pub auth_ssh_host: Option<String>,
    /// Target port for the `"ssh"` authenticator. Defaults to 22.
    pub auth_ssh_port: Option<u16>,

    /// Root directory containing one subdirectory per session. Defaults
    /// to `/var/lib/neatx/sessions`.
    pub sessions_dir: Option<PathBuf>,

    /// Path to the display-agent binary (e.g. `nxagent`).
    pub agent_path: Option<PathBuf>,
    /// Path to the `xauth` binary.
    pub xauth_path: Option<PathBuf>,
    /// Path to the `xrdb` binary.
    pub xrdb_path: Option<PathBuf>,
    /// Path to the data-relay binary the broker spawns after handshake.
    pub data_relay_path: Option<PathBuf>,
    /// Path to the `su` binary, used by the `"su"` authenticator.
    pub su_path: Option<PathBuf>,
    /// Path to the `ssh` binary, used by the `"ssh"` authenticator.
    pub ssh_path: Option<PathBuf>,

    /// Default command used to start each `unix-*` session type, keyed by
    /// the type's suffix (`"kde"`, `"gnome"`, `"console"`). Session types
    /// absent from this map fall back to the session's own
    /// `--application` parameter.
    pub session_commands: Option<std::collections::BTreeMap<String, String>>,
}

impl Config {
    pub fn protocol_version(&self) -> &str {
        self.protocol_version.as_deref().unwrap_or(consts::DEFAULT_NX_PROTOCOL_VERSION)
    }

    pub fn auth_method(&self) -> &str {
        self.auth_method.as_deref().unwrap_or(consts::AUTH_METHOD_SU)
    }

    pub fn auth_ssh_port(&self) -> u16 {
        self.auth_ssh_port.unwrap_or(consts::DEFAULT_SSH_PORT)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.sessions_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/lib/neatx/sessions"))
    }

    pub fn agent_path(&self) -> PathBuf {
        self.agent_path.clone().unwrap_or_else(|| PathBuf::from("/usr/bin/nxagent"))
    }

    pub fn xauth_path(&self) -> PathBuf {
        self.xauth_path.clone().unwrap_or_else(|| PathBuf::from("/usr/bin/xauth"))
    }

    pub fn xrdb_path(&self) -> PathBuf {
        self.xrdb_path.clone().unwrap_or_else(|| PathBuf::from("/usr/bin/xrdb"))
    }

    pub fn su_path(&self) -> PathBuf {
        self.su_path.clone().unwrap_or_else(|| PathBuf::from("/bin/su"))
    }

    pub fn ssh_path(&self) -> PathBuf {
        self.ssh_path.clone().unwrap_or_else(|| PathBuf::from("/usr/bin/ssh"))
    }

    pub fn data_relay_path(&self) -> PathBuf {
        self.data_relay_path.clone().unwrap_or_else(|| PathBuf::from("/usr/bin/nxproxy"))
    }
}

/// Default config file location: `~/.config/neatx/config.toml`. Falls
/// back silently (an absent file is not an error; all fields default).
fn default_config_path() -> anyhow::Result<PathBuf> {
    let info = user::info().context("resolving current user for default config path")?;
    Ok(Path::new(&info.home_dir).join(".config").join("neatx").join("config.toml"))
}

/// Reads the config file at `config_file`, or the default location if
/// `None`. A missing file at the default location yields an empty
/// (all-default) config; a missing file at an explicitly requested path
/// is an error.
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let (path, explicit) = match config_file {
        Some(p) => (PathBuf::from(p), true),
        None => (default_config_path()?, false),
    };

    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
            return Ok(Config::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("reading config file {path:?}"));
        }
    };

    toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_default_config_is_not_an_error() {
        let cfg = Config::default();
        assert_eq!(cfg.protocol_version(), consts::DEFAULT_NX_PROTOCOL_VERSION);
        assert_eq!(cfg.auth_method(), consts::AUTH_METHOD_SU);
        assert_eq!(cfg.auth_ssh_port(), 22);
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let err = read_config(&Some("/nonexistent/path/neatx.toml".to_string())).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }

    #[test]
    fn parses_overridden_fields() {
        let toml_src = r#"
            protocol_version = "3.3.0"
            auth_method = "ssh"
            auth_ssh_host = "gateway.example.com"
            auth_ssh_port = 2222
        "#;
        let cfg: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.protocol_version(), "3.3.0");
        assert_eq!(cfg.auth_method(), "ssh");
        assert_eq!(cfg.auth_ssh_host.as_deref(), Some("gateway.example.com"));
        assert_eq!(cfg.auth_ssh_port(), 2222);
    }
}
