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

//! The node daemon's own termination handling: a `TERM_SIGNALS` handler
//! that removes the session's RPC socket before exiting, so a killed
//! daemon never leaves a stale socket behind for the next one to trip
//! over in [`crate::daemon::rpcserver::bind`].

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::iterator::Signals;
use signal_hook::flag;
use tracing::{error, info};

pub struct Handler {
    sock: PathBuf,
}

impl Handler {
    pub fn new(sock: PathBuf) -> Self {
        Handler { sock }
    }

    /// Spawns a dedicated thread that blocks on `TERM_SIGNALS`, cleans up
    /// the socket, and exits. A second term signal bypasses the cleanup
    /// and kills the process immediately, so a daemon stuck in cleanup
    /// doesn't absorb a frustrated double ^C.
    pub fn spawn(self) -> anyhow::Result<()> {
        let term_now = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term_now))?;
            flag::register(*sig, Arc::clone(&term_now))?;
        }

        let mut signals = Signals::new(TERM_SIGNALS).context("creating signal iterator")?;
        thread::spawn(move || {
            #[allow(clippy::never_loop)]
            for signal in &mut signals {
                assert!(TERM_SIGNALS.contains(&signal));

                info!("term sig handler: cleaning up node socket");
                if let Err(e) = std::fs::remove_file(&self.sock) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        error!("error cleaning up node socket: {e}");
                    }
                }

                info!("term sig handler: exiting");
                std::process::exit(0);
            }
        });

        Ok(())
    }
}
