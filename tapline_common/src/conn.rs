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

use crate::config::Profile;
use crate::crypto::{self, KeyStream, NonceSeq};
use crate::tap::FrameTap;
use crate::SessionError;

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use sha2::{Digest, Sha224};
use socket2::{Domain, Protocol, Socket, Type};

/// Install name exchange length in bytes.
pub const INSTALL_NAME_LEN: usize = 1024;
/// Upper bound on the pre-handshake cover data.
pub const MAX_JUNK: usize = 1024;
/// SHA-224 frame digest length in bytes.
pub const DIGEST_LEN: usize = 28;
/// Largest payload a single frame can carry.
pub const MAX_FRAME: usize = u16::MAX as usize;

/// TCP connect timeout. The connection attempt is aborted if the peer
/// doesn't respond.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval of the accept loop, used for cancellation while waiting
/// for the peer to call in.
pub const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// The direction of TCP session establishment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeerMode {
    /// Wait for the peer to connect to us.
    Listen,
    /// Call out to the peer.
    Connect,
}

/// A `PeerConn` is a fresh TCP connection to the peer that has not completed
/// the handshake yet, transforming into a [`TunnelConn`] on success.
pub struct PeerConn {
    stream: TcpStream,
}

impl PeerConn {
    /// Establishes the TCP connection per the configured mode and applies
    /// the send/receive timeouts that bound all further socket operations.
    ///
    /// In listen mode this blocks until the peer calls in or `cancel` is
    /// raised; exactly one peer is accepted and the listener is closed
    /// before this returns.
    pub fn open(profile: &Profile, cancel: &AtomicBool) -> Result<Self, SessionError> {
        let addrs = resolve(&profile.host, profile.port)?;

        let stream = match profile.mode {
            PeerMode::Listen => listen_first_success(&addrs, cancel)?,
            PeerMode::Connect => connect_first_success(&addrs)?,
        };

        let timeout = (!profile.io_timeout.is_zero()).then_some(profile.io_timeout);
        stream
            .set_read_timeout(timeout)
            .map_err(SessionError::SetTimeout)?;
        stream
            .set_write_timeout(timeout)
            .map_err(SessionError::SetTimeout)?;

        Ok(Self { stream })
    }

    /// Performs the tunnel handshake, returning a [`TunnelConn`] on success:
    /// drains the peer's cover bytes, sends a fresh session nonce in the
    /// clear, derives the directional keystreams from it and the wall clock,
    /// and answers the peer's install name challenge.
    ///
    /// The nonce is the only plaintext on the wire; everything after it runs
    /// through the keystreams, starting with the install name exchange.
    pub fn secure_stream(
        self,
        profile: &Profile,
        nonces: &mut NonceSeq,
        now: u64,
    ) -> Result<TunnelConn, SessionError> {
        // Consuming the `PeerConn` guarantees that this function can never be called again.

        let mut junk = [0; MAX_JUNK];
        recv_all(&self.stream, &mut junk[..profile.junk_size])
            .map_err(|_| SessionError::JunkRead)?;

        let nonce = nonces.next_nonce();
        send_all(&self.stream, &nonce).map_err(|_| SessionError::NonceSend)?;

        let (tx, rx) = crypto::derive_pair(&profile.key, &nonce, now);
        let conn = TunnelConn {
            stream: self.stream,
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        };

        let mut name = [0; INSTALL_NAME_LEN];
        conn.recv_enc(&mut name)
            .map_err(|_| SessionError::InstallNameRecv)?;

        if !crypto::ct_equal(&name, &profile.install_name[..]) {
            return Err(SessionError::InstallNameMismatch);
        }

        conn.send_enc(&name)
            .map_err(|_| SessionError::InstallNameEcho)?;

        Ok(conn)
    }
}

impl From<TcpStream> for PeerConn {
    fn from(stream: TcpStream) -> Self {
        Self { stream }
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, SessionError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| SessionError::AddressResolve)?
        .collect();

    if addrs.is_empty() {
        return Err(SessionError::AddressResolve);
    }

    Ok(addrs)
}

/// Iterates over the passed addresses until one of them can be bound and
/// listened on, then accepts a single peer. The accept loop polls so a
/// raised `cancel` flag aborts the wait.
fn listen_first_success(
    addrs: &[SocketAddr],
    cancel: &AtomicBool,
) -> Result<TcpStream, SessionError> {
    for addr in addrs {
        let listener = match bind_reusable(*addr) {
            Ok(listener) => listener,
            Err(_) => continue,
        };

        listener
            .set_nonblocking(true)
            .map_err(SessionError::Accept)?;

        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false).map_err(SessionError::Accept)?;
                    return Ok(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if cancel.load(Ordering::SeqCst) {
                        return Err(SessionError::Accept(io::Error::from(
                            io::ErrorKind::Interrupted,
                        )));
                    }

                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(SessionError::Accept(e)),
            }
        }
    }

    Err(SessionError::Listen)
}

fn bind_reusable(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;

    // Only one peer is allowed per session.
    socket.listen(1)?;

    Ok(socket.into())
}

/// Iterates over the passed addresses until a connection succeeds
/// or there are no more addresses left to try.
fn connect_first_success(addrs: &[SocketAddr]) -> Result<TcpStream, SessionError> {
    for addr in addrs {
        if let Ok(stream) = TcpStream::connect_timeout(addr, CONNECT_TIMEOUT) {
            return Ok(stream);
        }
    }

    Err(SessionError::Connect)
}

fn send_all(mut stream: &TcpStream, buf: &[u8]) -> Result<(), SessionError> {
    stream.write_all(buf).map_err(|e| match e.kind() {
        io::ErrorKind::WriteZero => SessionError::Disconnect,
        _ => SessionError::Send,
    })
}

fn recv_all(mut stream: &TcpStream, buf: &mut [u8]) -> Result<(), SessionError> {
    stream.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => SessionError::Disconnect,
        _ => SessionError::Recv,
    })
}

/// A `TunnelConn` is an established tunnel session: a TCP connection whose
/// traffic is protected by the directional keystreams negotiated in
/// [`PeerConn::secure_stream`].
///
/// The two pump flows share a `TunnelConn` by reference. One flow only
/// sends and the other only receives, so the socket itself needs no lock
/// and each keystream mutex is effectively uncontended.
pub struct TunnelConn {
    stream: TcpStream,
    tx: Mutex<KeyStream>,
    rx: Mutex<KeyStream>,
}

impl TunnelConn {
    /// Encodes one captured frame and sends it to the peer: the big-endian
    /// length and the payload first, then the SHA-224 digest over both,
    /// everything tx-encrypted.
    pub fn send_frame(&self, payload: &[u8]) -> Result<(), SessionError> {
        // A zero length on the wire would introduce a keepalive.
        if payload.is_empty() {
            return Err(SessionError::CaptureTruncated);
        }
        if payload.len() > MAX_FRAME {
            return Err(SessionError::CaptureTooLarge);
        }

        let mut buf = Vec::with_capacity(2 + payload.len());
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(payload);

        let digest = Sha224::digest(&buf);

        self.send_enc(&buf)?;
        self.send_enc(&digest)?;

        Ok(())
    }

    /// Receives the next data frame from the peer, absorbing any keepalives
    /// along the way. The returned payload has passed digest verification.
    pub fn recv_frame(&self) -> Result<Vec<u8>, SessionError> {
        loop {
            let mut len_bytes = [0; 2];
            self.recv_enc(&mut len_bytes)?;
            let len = u16::from_be_bytes(len_bytes) as usize;

            // A zero length introduces a keepalive: a junk length followed
            // by that much cover data, consumed and dropped. The keystream
            // advances over the junk like over any other traffic.
            if len == 0 {
                let mut junk_len_bytes = [0; 2];
                self.recv_enc(&mut junk_len_bytes)?;
                let junk_len = u16::from_be_bytes(junk_len_bytes) as usize;

                let mut junk = vec![0; junk_len];
                self.recv_enc(&mut junk)?;
                continue;
            }

            let mut buf = vec![0; 2 + len];
            buf[..2].copy_from_slice(&len_bytes);
            self.recv_enc(&mut buf[2..])?;

            let mut digest = [0; DIGEST_LEN];
            self.recv_enc(&mut digest)?;

            if !crypto::ct_equal(&Sha224::digest(&buf), &digest) {
                return Err(SessionError::HashMismatch);
            }

            buf.drain(..2);
            return Ok(buf);
        }
    }

    /// Runs the bidirectional pump until either flow hits a terminal
    /// condition: captured frames are framed and sent to the peer while
    /// received frames are injected back into the tap.
    ///
    /// The first error wins the session's fault slot. Whichever flow ends
    /// first cancels the other explicitly: the sender shuts the socket down
    /// to unblock the receiver, the receiver interrupts the capture loop to
    /// unblock the sender. Both flows are joined before this returns.
    pub fn relay<T: FrameTap + Sync>(&self, tap: &T) -> Result<(), SessionError> {
        let fault = Fault::new();

        thread::scope(|s| {
            s.spawn(|| {
                let res = tap.capture(|captured| {
                    if captured.data.len() != captured.wire_len {
                        return Err(SessionError::CaptureTruncated);
                    }

                    self.send_frame(captured.data)
                });

                if let Err(e) = res {
                    fault.set(e);
                }
                self.shutdown();
            });

            s.spawn(|| {
                let e = loop {
                    match self.recv_frame() {
                        Ok(frame) => {
                            if let Err(e) = tap.inject(&frame) {
                                break e;
                            }
                        }
                        Err(e) => break e,
                    }
                };

                fault.set(e);
                tap.interrupt();
            });
        });

        match fault.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn send_enc(&self, buf: &[u8]) -> Result<(), SessionError> {
        // Encrypt a copy so the caller keeps the plaintext.
        let mut enc = buf.to_vec();
        self.tx.lock().unwrap().apply(&mut enc);

        send_all(&self.stream, &enc)
    }

    fn recv_enc(&self, buf: &mut [u8]) -> Result<(), SessionError> {
        recv_all(&self.stream, buf)?;
        self.rx.lock().unwrap().apply(buf);

        Ok(())
    }

    /// Shuts the socket down in both directions, causing a blocked receive
    /// in the other flow to return.
    fn shutdown(&self) {
        self.stream.shutdown(Shutdown::Both).ok();
    }
}

/// The session's write-once fault slot. The first flow to fail stores its
/// error; later writes are dropped.
struct Fault(Mutex<Option<SessionError>>);

impl Fault {
    fn new() -> Self {
        Self(Mutex::new(None))
    }

    fn set(&self, e: SessionError) {
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    fn take(&self) -> Option<SessionError> {
        self.0.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; crypto::KEY_LEN] = [0x17; crypto::KEY_LEN];
    const NOW: u64 = 1_700_000_000;

    /// Returns a mirrored pair of tunnel connections over a localhost
    /// socket pair: what one sends, the other receives.
    fn tunnel_pair() -> (TunnelConn, TunnelConn) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();

        for stream in [&a, &b] {
            stream
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
        }

        let nonce = [0x5a; crypto::NONCE_LEN];
        let (a_tx, a_rx) = crypto::derive_pair(&KEY, &nonce, NOW);
        let (rx_nonce, tx_nonce) = crypto::session_nonces(&nonce, NOW);

        (
            TunnelConn {
                stream: a,
                tx: Mutex::new(a_tx),
                rx: Mutex::new(a_rx),
            },
            TunnelConn {
                stream: b,
                // Mirrored: b transmits on a's receive nonce and vice versa.
                tx: Mutex::new(KeyStream::new(&KEY, &rx_nonce)),
                rx: Mutex::new(KeyStream::new(&KEY, &tx_nonce)),
            },
        )
    }

    #[test]
    fn frames_round_trip() {
        let (a, b) = tunnel_pair();

        // A full-size frame outgrows the socket buffers,
        // so send and receive concurrently.
        thread::scope(|s| {
            s.spawn(|| {
                a.send_frame(&[1, 2, 3, 4, 5]).unwrap();
                a.send_frame(&vec![0xee; MAX_FRAME]).unwrap();
            });

            assert_eq!(b.recv_frame().unwrap(), vec![1, 2, 3, 4, 5]);
            assert_eq!(b.recv_frame().unwrap(), vec![0xee; MAX_FRAME]);
        });
    }

    #[test]
    fn send_frame_rejects_bad_sizes() {
        let (a, _b) = tunnel_pair();

        assert!(matches!(
            a.send_frame(&[]),
            Err(SessionError::CaptureTruncated)
        ));
        assert!(matches!(
            a.send_frame(&vec![0; MAX_FRAME + 1]),
            Err(SessionError::CaptureTooLarge)
        ));
    }

    /// Composes the ciphertext of a valid data frame, then lets the caller
    /// disturb one byte of it before it goes out.
    fn send_tampered(conn: &TunnelConn, payload: &[u8], flip_at: usize) {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);

        let digest = Sha224::digest(&frame);
        frame.extend_from_slice(&digest);

        conn.tx.lock().unwrap().apply(&mut frame);
        frame[flip_at] ^= 0x01;
        send_all(&conn.stream, &frame).unwrap();
    }

    #[test]
    fn recv_frame_rejects_tampered_digest() {
        let (a, b) = tunnel_pair();

        send_tampered(&a, &[1, 2, 3, 4, 5], 2 + 5);

        assert!(matches!(b.recv_frame(), Err(SessionError::HashMismatch)));
    }

    #[test]
    fn recv_frame_rejects_tampered_payload() {
        let (a, b) = tunnel_pair();

        send_tampered(&a, &[1, 2, 3, 4, 5], 2);

        assert!(matches!(b.recv_frame(), Err(SessionError::HashMismatch)));
    }

    #[test]
    fn recv_frame_rejects_tampered_length() {
        let (a, b) = tunnel_pair();

        // The flipped bit shrinks the length from 5 to 4, so the receiver
        // misparses the remaining bytes but never outruns them.
        send_tampered(&a, &[1, 2, 3, 4, 5], 1);

        assert!(matches!(b.recv_frame(), Err(SessionError::HashMismatch)));
    }

    #[test]
    fn recv_frame_absorbs_keepalives() {
        let (a, b) = tunnel_pair();

        // Keepalive with 3 junk bytes, then a data frame.
        let mut keepalive = vec![0x00, 0x00, 0x00, 0x03, 0xaa, 0xbb, 0xcc];
        a.tx.lock().unwrap().apply(&mut keepalive);
        send_all(&a.stream, &keepalive).unwrap();

        a.send_frame(&[0x42]).unwrap();

        assert_eq!(b.recv_frame().unwrap(), vec![0x42]);
    }

    #[test]
    fn recv_frame_reports_disconnects() {
        let (a, b) = tunnel_pair();

        // A length announcing more payload than ever arrives.
        let mut partial = vec![0x00, 0x64, 0x01, 0x02];
        a.tx.lock().unwrap().apply(&mut partial);
        send_all(&a.stream, &partial).unwrap();
        drop(a);

        assert!(matches!(
            b.recv_frame(),
            Err(SessionError::Disconnect)
        ));
    }

    #[test]
    fn fault_is_write_once() {
        let fault = Fault::new();

        fault.set(SessionError::HashMismatch);
        fault.set(SessionError::Disconnect);

        assert!(matches!(
            fault.take(),
            Some(SessionError::HashMismatch)
        ));
        assert!(fault.take().is_none());
    }
}
