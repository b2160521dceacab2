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

use tapline_common::config::Profile;
use tapline_common::conn::PeerConn;
use tapline_common::crypto::{self, NonceSeq};
use tapline_common::report::Report;
use tapline_common::tap::FrameTap;
use tapline_common::SessionError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Poll interval for exit checks while sleeping between sessions.
const EXIT_POLL: Duration = Duration::from_millis(200);

/// A `Runtime` bundles the process-wide state the supervisor threads through
/// the retry loop: the validated profile and the session nonce sequence.
pub struct Runtime {
    profile: Profile,
    nonces: Mutex<NonceSeq>,
}

impl Runtime {
    /// Builds the runtime context from a validated profile.
    pub fn new(profile: Profile) -> Self {
        let nonces = Mutex::new(NonceSeq::new(&profile.key));

        Self { profile, nonces }
    }

    /// Returns the profile this runtime was built from.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }
}

/// Runs tunnel sessions forever: open, handshake, pump, teardown, sleep,
/// repeat. Every session failure is recorded through `report` and retried
/// after the configured sleep; only a raised `should_exit` ends the loop.
pub fn serve<T, F, R>(rt: &Runtime, report: &R, open_tap: F, should_exit: &AtomicBool)
where
    T: FrameTap + Sync,
    F: Fn(&Profile) -> Result<T, SessionError>,
    R: Report,
{
    while !should_exit.load(Ordering::SeqCst) {
        report.clear();

        match session(rt, &open_tap, should_exit) {
            Ok(_) => eprintln!("[info] Session ended"),
            Err(e) => {
                if should_exit.load(Ordering::SeqCst) {
                    break;
                }

                eprintln!("[warn] Session failed: {}", e);
                report.record(e.code());
            }
        }

        sleep_poll(rt.profile.sleep, should_exit);
    }
}

/// One full session: connect or accept, handshake, open the tap and pump
/// frames until a terminal condition. All session resources are dropped on
/// every exit path.
fn session<T, F>(
    rt: &Runtime,
    open_tap: &F,
    cancel: &AtomicBool,
) -> Result<(), SessionError>
where
    T: FrameTap + Sync,
    F: Fn(&Profile) -> Result<T, SessionError>,
{
    let profile = &rt.profile;

    let conn = PeerConn::open(profile, cancel)?;

    let now = crypto::unix_time()?;
    let tunnel = conn.secure_stream(profile, &mut rt.nonces.lock().unwrap(), now)?;

    eprintln!("[info] <{}:{}> Tunnel established", profile.host, profile.port);

    let tap = open_tap(profile)?;
    tunnel.relay(&tap)
}

fn sleep_poll(total: Duration, should_exit: &AtomicBool) {
    let mut remaining = total;

    while !remaining.is_zero() && !should_exit.load(Ordering::SeqCst) {
        let step = remaining.min(EXIT_POLL);
        thread::sleep(step);
        remaining -= step;
    }
}
