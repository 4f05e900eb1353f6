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
//! neatx is an NX 3.x-compatible remote-desktop session broker: a login
//! front-end, a per-user session broker, and a per-session node daemon
//! that supervises the display agent. See the
//! [README](https://github.com/neatx-project/neatx) for more info.
use clap::Parser;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let args = libneatx::Args::parse();

    if args.version() {
        println!("neatx {}", VERSION);
        return Ok(());
    }

    libneatx::run(args)
}
