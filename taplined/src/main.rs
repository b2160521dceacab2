// taplined is a tapline daemon tunneling link-layer frames to a remote peer.
// Copyright (C) 2026  tapline developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use taplined::supervisor::{serve, Runtime};
use taplined::tap::PcapTap;
use taplined::Result;

use tapline_common::config::EndpointConfig;
use tapline_common::report::EnvReport;

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use fork::{daemon, Fork};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
/// Background process bridging a network interface to the tunnel peer.
struct Args {
    /// Stay attached to the terminal instead of daemonizing.
    #[arg(short, long)]
    debug: bool,
    /// Read the configuration from this file instead of the default path.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    if !args.debug {
        match daemon(false, false) {
            Ok(Fork::Child) => {}
            Ok(Fork::Parent(_)) => process::exit(0),
            Err(e) => {
                eprintln!("Daemonization error: {}", e);
                process::exit(1);
            }
        }
    }

    match run(&args) {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(e.exit_code());
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => EndpointConfig::load_from(path)?,
        None => EndpointConfig::load()?,
    };
    let profile = config.validate()?;

    let should_exit = Arc::new(AtomicBool::new(false));
    let should_exit2 = Arc::clone(&should_exit);

    ctrlc::set_handler(move || {
        eprintln!("[info] Caught SIGINT, SIGTERM or SIGHUP, exiting");
        should_exit2.store(true, Ordering::SeqCst);
    })?;

    let report = EnvReport::new(profile.report.clone());
    let rt = Runtime::new(profile);

    eprintln!(
        "[info] <{}:{}> Serving tunnel sessions",
        rt.profile().host,
        rt.profile().port
    );

    serve(
        &rt,
        &report,
        |profile| PcapTap::open(&profile.capture),
        &should_exit,
    );

    Ok(())
}
