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

use tapline_common::config::CaptureSettings;
use tapline_common::tap::{Captured, FrameTap};
use tapline_common::SessionError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use pcap::{Active, Capture};

/// Capture read timeout in milliseconds, letting the loop notice interrupts.
const READ_TIMEOUT_MS: i32 = 200;

/// A `PcapTap` drives the configured interface through libpcap: frames
/// matching the filter come out of the capture loop and received tunnel
/// frames are injected raw.
pub struct PcapTap {
    capture: Mutex<Capture<Active>>,
    stop: AtomicBool,
}

impl PcapTap {
    /// Opens the interface with the configured snapshot length and installs
    /// the filter. No packet is delivered before the filter is in place.
    pub fn open(settings: &CaptureSettings) -> Result<Self, SessionError> {
        let mut capture = Capture::from_device(settings.interface.as_str())
            .map_err(|e| SessionError::CaptureOpen(e.to_string()))?
            .snaplen(settings.snaplen)
            .timeout(READ_TIMEOUT_MS)
            .open()
            .map_err(|e| SessionError::CaptureOpen(e.to_string()))?;

        if !settings.filter.is_empty() {
            capture
                .filter(&settings.filter, true)
                .map_err(|e| SessionError::CaptureFilter(e.to_string()))?;
        }

        Ok(Self {
            capture: Mutex::new(capture),
            stop: AtomicBool::new(false),
        })
    }
}

impl FrameTap for PcapTap {
    fn capture<F>(&self, mut deliver: F) -> Result<(), SessionError>
    where
        F: FnMut(Captured<'_>) -> Result<(), SessionError>,
    {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }

            // The injector shares the handle, so hold the lock for at most
            // one timeout-bounded read.
            let mut capture = self.capture.lock().unwrap();
            match capture.next_packet() {
                Ok(packet) => deliver(Captured {
                    data: packet.data,
                    wire_len: packet.header.len as usize,
                })?,
                Err(pcap::Error::TimeoutExpired) => {}
                Err(e) => return Err(SessionError::Capture(e.to_string())),
            }
        }
    }

    fn inject(&self, frame: &[u8]) -> Result<(), SessionError> {
        self.capture
            .lock()
            .unwrap()
            .sendpacket(frame)
            .map_err(|e| SessionError::Capture(e.to_string()))
    }

    fn interrupt(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
