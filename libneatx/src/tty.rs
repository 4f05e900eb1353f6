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

//! Terminal-mode helpers: disabling echo while the front-end prompts for a
//! password (§4.3, step 4) and while the authenticator's PTY dialog is in
//! flight.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;

use anyhow::Context;
use nix::sys::termios::{self, LocalFlags, SetArg, Termios};

/// RAII guard that restores a file descriptor's termios settings on drop.
/// Mirrors the teacher's attach-flags guard: callers get a fresh, modified
/// mode for as long as the guard lives and the original mode back
/// automatically, even on an early return or panic.
pub struct EchoGuard {
    fd: RawFd,
    original: Termios,
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(self.fd) };
        if let Err(e) = termios::tcsetattr(borrowed, SetArg::TCSANOW, &self.original) {
            tracing::warn!("failed to restore terminal echo state: {:?}", e);
        }
    }
}

/// Disables the ECHO local flag on `fd`, returning a guard that restores
/// it when dropped. If `fd` is not a tty this is a no-op error the caller
/// can choose to ignore (non-interactive stdin is common under test
/// harnesses and service supervisors).
pub fn disable_echo(fd: RawFd) -> anyhow::Result<EchoGuard> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let original = termios::tcgetattr(borrowed).context("fd is not a tty, cannot disable echo")?;
    let mut modified = original.clone();
    modified.local_flags.remove(LocalFlags::ECHO);
    termios::tcsetattr(borrowed, SetArg::TCSANOW, &modified).context("failed to disable echo")?;
    Ok(EchoGuard { fd, original })
}

/// Calls `fn` with echo disabled on `fd`, restoring it afterward
/// regardless of how `f` returns. Mirrors the source's
/// `WithoutTerminalEcho` helper.
pub fn without_echo<T>(fd: RawFd, f: impl FnOnce() -> T) -> anyhow::Result<T> {
    let _guard = disable_echo(fd)?;
    Ok(f())
}
