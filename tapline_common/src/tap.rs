// tapline_common is the main tapline library implementing the tunnel protocol.
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

use crate::SessionError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

/// How often an interrupted capture loop gets to notice the interruption.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// One captured link-layer frame as delivered by a [`FrameTap`].
#[derive(Clone, Copy, Debug)]
pub struct Captured<'a> {
    /// The captured bytes.
    pub data: &'a [u8],
    /// The frame's length on the wire. Differs from `data.len()`
    /// if the capture was cut short by the snapshot length.
    pub wire_len: usize,
}

/// A `FrameTap` connects the tunnel to the monitored interface:
/// it delivers captured frames and writes injected frames back out.
///
/// Implementations are driven from two threads at once, one blocking in
/// [`FrameTap::capture`] while the other calls [`FrameTap::inject`],
/// which is why both take `&self`.
pub trait FrameTap {
    /// Blocks delivering captured frames to `deliver` until
    /// [`FrameTap::interrupt`] is called (returning `Ok`)
    /// or the capture or a delivery fails (returning the error).
    fn capture<F>(&self, deliver: F) -> Result<(), SessionError>
    where
        F: FnMut(Captured<'_>) -> Result<(), SessionError>;

    /// Writes one raw frame to the interface.
    fn inject(&self, frame: &[u8]) -> Result<(), SessionError>;

    /// Causes a concurrent [`FrameTap::capture`] to return.
    fn interrupt(&self);
}

/// A `MemoryTap` is a channel-backed [`FrameTap`] for tests and loopback
/// experiments: frames pushed into the feed handle come out of the capture
/// loop, injected frames land on the drain handle.
pub struct MemoryTap {
    feed: Mutex<mpsc::Receiver<(Vec<u8>, usize)>>,
    drain: Mutex<mpsc::Sender<Vec<u8>>>,
    stop: AtomicBool,
}

impl MemoryTap {
    /// Creates a tap along with its feed and drain handles.
    /// The feed carries `(frame, wire_len)` pairs so tests can
    /// simulate truncated captures.
    pub fn new() -> (
        Self,
        mpsc::Sender<(Vec<u8>, usize)>,
        mpsc::Receiver<Vec<u8>>,
    ) {
        let (feed_tx, feed_rx) = mpsc::channel();
        let (drain_tx, drain_rx) = mpsc::channel();

        let tap = Self {
            feed: Mutex::new(feed_rx),
            drain: Mutex::new(drain_tx),
            stop: AtomicBool::new(false),
        };

        (tap, feed_tx, drain_rx)
    }
}

impl FrameTap for MemoryTap {
    fn capture<F>(&self, mut deliver: F) -> Result<(), SessionError>
    where
        F: FnMut(Captured<'_>) -> Result<(), SessionError>,
    {
        let feed = self.feed.lock().unwrap();

        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }

            match feed.recv_timeout(POLL_INTERVAL) {
                Ok((data, wire_len)) => deliver(Captured {
                    data: &data,
                    wire_len,
                })?,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(SessionError::Capture("frame feed closed".to_string()));
                }
            }
        }
    }

    fn inject(&self, frame: &[u8]) -> Result<(), SessionError> {
        self.drain
            .lock()
            .unwrap()
            .send(frame.to_vec())
            .map_err(|_| SessionError::Capture("frame drain closed".to_string()))
    }

    fn interrupt(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn capture_delivers_fed_frames() {
        let (tap, feed, _drain) = MemoryTap::new();

        feed.send((vec![1, 2, 3], 3)).unwrap();
        feed.send((vec![4, 5], 1500)).unwrap();

        let mut seen = Vec::new();
        let res = tap.capture(|captured| {
            seen.push((captured.data.to_vec(), captured.wire_len));

            if seen.len() == 2 {
                tap.interrupt();
            }
            Ok(())
        });

        assert!(res.is_ok());
        assert_eq!(seen, vec![(vec![1, 2, 3], 3), (vec![4, 5], 1500)]);
    }

    #[test]
    fn capture_stops_on_delivery_error() {
        let (tap, feed, _drain) = MemoryTap::new();
        feed.send((vec![0xaa], 1)).unwrap();

        let res = tap.capture(|_| Err(SessionError::Send));
        assert!(matches!(res, Err(SessionError::Send)));
    }

    #[test]
    fn interrupt_unblocks_capture() {
        let (tap, _feed, _drain) = MemoryTap::new();

        thread::scope(|s| {
            s.spawn(|| {
                let res = tap.capture(|_| Ok(()));
                assert!(res.is_ok());
            });

            tap.interrupt();
        });
    }

    #[test]
    fn inject_reaches_the_drain() {
        let (tap, _feed, drain) = MemoryTap::new();

        tap.inject(&[9, 8, 7]).unwrap();
        assert_eq!(drain.recv().unwrap(), vec![9, 8, 7]);
    }
}
