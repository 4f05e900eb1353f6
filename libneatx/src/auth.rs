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

//! The authenticator contract (§4.3.1): forks a PTY, execs a helper that
//! eventually lands the caller at an `NX> ` prompt authenticated as the
//! target user, and drives the password dialog over the PTY exactly once.
//!
//! Two authenticators are provided: [`SuAuth`], which re-execs under the
//! local `su`, and [`SshAuth`], which hops through a loopback `ssh` to
//! reuse the host's own PAM stack. Both share the same dialog state
//! machine; only the spawned command and the password-prompt pattern
//! differ.

use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::Instant;

use anyhow::Context;
use lazy_static::lazy_static;
use regex::Regex;

use crate::config::Config;
use crate::consts;
use crate::errors::{AuthFailedError, AuthTimeoutError, UnknownAuthMethod};

lazy_static! {
    static ref SU_PASSWORD_PROMPT: Regex = Regex::new(r"(?im)^Password:\s*").unwrap();
    static ref SSH_PASSWORD_PROMPT: Regex = Regex::new(r"(?im)^.*@.*\s+password:\s*").unwrap();
    static ref NX_PROMPT_RE: Regex = Regex::new(r"(?m)^NX> ").unwrap();
}

/// Builds the argv a particular authentication method execs to reach an
/// authenticated shell running `argv` as `user`.
pub trait Authenticator {
    /// Regex matching this method's password prompt.
    fn password_prompt(&self) -> &Regex;

    /// The command to fork+exec under the PTY.
    fn command(&self, user: &str, argv: &[String]) -> Command;
}

/// `su <user> -c "cd && <quoted argv>"`.
pub struct SuAuth {
    pub su_path: std::path::PathBuf,
}

impl Authenticator for SuAuth {
    fn password_prompt(&self) -> &Regex {
        &SU_PASSWORD_PROMPT
    }

    fn command(&self, user: &str, argv: &[String]) -> Command {
        let quoted = shell_words::join(argv);
        let mut cmd = Command::new(&self.su_path);
        cmd.arg(user).arg("-c").arg(format!("cd && {quoted}"));
        cmd
    }
}

/// `ssh -2 -x -l <user> -p <port> <options...> <host> -- <quoted argv>`.
pub struct SshAuth {
    pub ssh_path: std::path::PathBuf,
    pub host: String,
    pub port: u16,
}

impl Authenticator for SshAuth {
    fn password_prompt(&self) -> &Regex {
        &SSH_PASSWORD_PROMPT
    }

    fn command(&self, user: &str, argv: &[String]) -> Command {
        let quoted = shell_words::join(argv);
        let mut cmd = Command::new(&self.ssh_path);
        cmd.arg("-2")
            .arg("-x")
            .arg("-l")
            .arg(user)
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-o")
            .arg("NumberOfPasswordPrompts=1")
            .arg("-o")
            .arg("PreferredAuthentications=password")
            .arg("-o")
            .arg("EscapeChar=none")
            .arg("-o")
            .arg("Compression=no")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg(&self.host)
            .arg("--")
            .arg(quoted);
        cmd
    }
}

/// Builds the configured authenticator (§7, kind 6: an unknown method name
/// is a fatal configuration error).
pub fn from_config(cfg: &Config) -> Result<Box<dyn Authenticator>, UnknownAuthMethod> {
    match cfg.auth_method() {
        consts::AUTH_METHOD_SU => Ok(Box::new(SuAuth { su_path: cfg.su_path() })),
        consts::AUTH_METHOD_SSH => Ok(Box::new(SshAuth {
            ssh_path: cfg.ssh_path(),
            host: cfg.auth_ssh_host.clone().unwrap_or_default(),
            port: cfg.auth_ssh_port(),
        })),
        other => Err(UnknownAuthMethod(other.to_string())),
    }
}

/// Forks a PTY, execs `auth.command(user, argv)` under `LC_ALL=C`, and
/// drives the single-password dialog: on the password prompt, writes
/// `password` and a newline; on `NX> `, declares success; on timeout,
/// fails with [`AuthTimeoutError`]; on any other outcome (second prompt,
/// EOF, non-zero exit), fails with [`AuthFailedError`]. On success,
/// blocks splicing the PTY to the caller's own stdio until the
/// authenticated program exits, returning its exit status.
pub fn authenticate_and_run(
    auth: &dyn Authenticator,
    user: &str,
    password: &str,
    argv: &[String],
) -> anyhow::Result<i32> {
    let mut cmd = auth.command(user, argv);
    cmd.env("LC_ALL", "C");

    let mut fork = shpool_pty::fork::Fork::from_ptmx().context("forking pty for authenticator")?;
    if fork.is_child().is_ok() {
        let err = cmd.exec();
        eprintln!("authenticator exec error: {err:?}");
        std::process::exit(1);
    }

    let mut master = fork.is_parent().context("internal error: executing in child fork")?;

    let outcome = run_dialog(&mut master, auth.password_prompt(), password);

    match outcome {
        DialogOutcome::Authenticated => {
            splice_and_wait(master, &fork)
        }
        DialogOutcome::Failed(output) => {
            let _ = fork.wait_for_exit();
            Err(AuthFailedError(output).into())
        }
        DialogOutcome::TimedOut => {
            let _ = fork.wait_for_exit();
            Err(AuthTimeoutError.into())
        }
    }
}

enum DialogOutcome {
    Authenticated,
    Failed(String),
    TimedOut,
}

/// Reads from `master` until the password prompt or `NX> ` appears,
/// writing the password exactly once. Matches the source's
/// `AuthenticateAndRun` expect loop: after the password prompt is seen and
/// answered, only the `NX> ` pattern (success) or end-of-output (failure)
/// decide the outcome.
fn run_dialog(master: &mut shpool_pty::fork::Master, prompt: &Regex, password: &str) -> DialogOutcome {
    let deadline = Instant::now() + consts::AUTH_TIMEOUT;
    let mut sent_password = false;
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        if Instant::now() >= deadline {
            return DialogOutcome::TimedOut;
        }

        let n = match master.read(&mut chunk) {
            Ok(0) => {
                return if sent_password {
                    DialogOutcome::Failed(String::from_utf8_lossy(&buf).into_owned())
                } else {
                    DialogOutcome::TimedOut
                };
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(_) => return DialogOutcome::Failed(String::from_utf8_lossy(&buf).into_owned()),
        };

        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);

        if NX_PROMPT_RE.is_match(&text) {
            return DialogOutcome::Authenticated;
        }

        if !sent_password && prompt.is_match(&text) {
            sent_password = true;
            if master.write_all(password.as_bytes()).is_err() || master.write_all(b"\n").is_err() {
                return DialogOutcome::Failed("failed writing password to pty".to_string());
            }
            buf.clear();
        } else if sent_password && prompt.is_match(&text) {
            // A second password prompt means the first attempt was rejected.
            return DialogOutcome::Failed(text.into_owned());
        }
    }
}

/// After a successful dialog, splices the PTY master to our own stdio and
/// blocks until the authenticated program exits (mirrors the source's
/// `fdcopy`-plus-`Retry(_CheckChild, ...)` bring-up).
fn splice_and_wait(mut master: shpool_pty::fork::Master, fork: &shpool_pty::fork::Fork) -> anyhow::Result<i32> {
    let mut reader = master.clone();
    let writer_thread = std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if master.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut stdout = std::io::stdout();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stdout.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    }

    let _ = writer_thread.join();

    match fork.wait_for_exit().context("waiting for authenticated program to exit")? {
        (_, Some(status)) => Ok(status),
        (_, None) => Ok(0),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn su_command_quotes_argv() {
        let auth = SuAuth { su_path: "/bin/su".into() };
        let cmd = auth.command("alice", &["/bin/sh".to_string(), "-c".to_string(), "echo hi there".to_string()]);
        let program = cmd.get_program().to_string_lossy().into_owned();
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(program, "/bin/su");
        assert_eq!(args[0], "alice");
        assert_eq!(args[1], "-c");
        assert!(args[2].starts_with("cd && "));
        assert!(args[2].contains("'echo hi there'"));
    }

    #[test]
    fn ssh_command_has_the_exact_hardening_options() {
        let auth = SshAuth { ssh_path: "/usr/bin/ssh".into(), host: "gw.example.com".to_string(), port: 2222 };
        let cmd = auth.command("alice", &["/bin/sh".to_string()]);
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"gw.example.com".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert_eq!(args.last().unwrap(), "/bin/sh");
    }

    #[test]
    fn su_password_prompt_matches_standard_su_text() {
        assert!(SU_PASSWORD_PROMPT.is_match("Password: "));
    }

    #[test]
    fn ssh_password_prompt_matches_user_at_host_form() {
        assert!(SSH_PASSWORD_PROMPT.is_match("alice@gw.example.com's password: "));
    }

    #[test]
    fn from_config_rejects_unknown_method() {
        let mut cfg = Config::default();
        cfg.auth_method = Some("kerberos".to_string());
        assert!(from_config(&cfg).is_err());
    }
}
