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

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20Legacy;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

/// Tunnel key length in bytes.
pub const KEY_LEN: usize = 32;
/// Session nonce length in bytes.
pub const NONCE_LEN: usize = 8;

/// A `KeyStream` is one direction's ChaCha20 keystream, using the original
/// 64-bit-nonce construction. Applying it XORs keystream bytes into a buffer
/// in place; applying a second stream at the same position restores the
/// input, so encryption and decryption are the same operation.
///
/// The stream only ever advances. No keystream block is produced twice.
pub struct KeyStream {
    cipher: ChaCha20Legacy,
}

impl KeyStream {
    /// Creates a keystream from the tunnel key and an 8-byte nonce.
    pub fn new(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> Self {
        Self {
            cipher: ChaCha20Legacy::new(key.into(), nonce.into()),
        }
    }

    /// XORs the next keystream bytes into `buf`.
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
    }
}

/// A `NonceSeq` produces the per-session handshake nonces.
///
/// The session counter is incremented before use, serialized in little-endian
/// order and whitened through a keystream of its own, so nonces are distinct
/// within a process without the wire revealing how many sessions came before.
pub struct NonceSeq {
    counter: u64,
    stream: KeyStream,
}

impl NonceSeq {
    /// Creates a nonce sequence keyed with the tunnel key and a bootstrap
    /// nonce drawn from the operating system's random number generator,
    /// making the sequence unpredictable across restarts.
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        let mut bootstrap = [0; NONCE_LEN];
        OsRng.fill_bytes(&mut bootstrap);

        Self::with_bootstrap(key, bootstrap)
    }

    /// Creates a nonce sequence with a caller-provided bootstrap nonce.
    pub fn with_bootstrap(key: &[u8; KEY_LEN], bootstrap: [u8; NONCE_LEN]) -> Self {
        Self {
            counter: 0,
            stream: KeyStream::new(key, &bootstrap),
        }
    }

    /// Returns the next session nonce. The first call uses a counter of 1.
    pub fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        self.counter += 1;

        let mut nonce = self.counter.to_le_bytes();
        self.stream.apply(&mut nonce);
        nonce
    }
}

/// Mixes the wall clock into the handshake nonce and splits the result into
/// the receive and transmit nonces, in this order.
///
/// The two differ in exactly the low 2 bits of the first byte:
/// cleared on the receive side, set on the transmit side.
pub fn session_nonces(
    nonce: &[u8; NONCE_LEN],
    now: u64,
) -> ([u8; NONCE_LEN], [u8; NONCE_LEN]) {
    let mut timed = [0; NONCE_LEN];
    for (i, byte) in timed.iter_mut().enumerate() {
        *byte = nonce[i] ^ ((now >> (8 * i)) & 0xff) as u8;
    }

    let mut rx = timed;
    rx[0] &= 0xfc;

    let mut tx = rx;
    tx[0] |= 0x03;

    (rx, tx)
}

/// Derives the transmit and receive keystreams of a session, in this order,
/// from the handshake nonce and the Unix time in seconds.
///
/// Both ends run the same derivation and must agree on the wall-clock
/// second; there is no tolerance window.
pub fn derive_pair(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    now: u64,
) -> (KeyStream, KeyStream) {
    let (rx, tx) = session_nonces(nonce, now);

    (KeyStream::new(key, &tx), KeyStream::new(key, &rx))
}

/// Compares two byte slices in constant time.
/// Slices of unequal length compare unequal.
pub fn ct_equal(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Returns the current Unix time in seconds.
pub fn unix_time() -> Result<u64, SessionError> {
    let now = Utc::now().timestamp();
    if now < 0 {
        return Err(SessionError::Clock);
    }

    Ok(now as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    const KEY: [u8; KEY_LEN] = [0x42; KEY_LEN];

    #[test]
    fn keystream_is_its_own_inverse() {
        let nonce = [7; NONCE_LEN];
        let plaintext = b"a frame of no particular significance".to_vec();

        let mut buf = plaintext.clone();
        KeyStream::new(&KEY, &nonce).apply(&mut buf);
        assert_ne!(buf, plaintext);

        KeyStream::new(&KEY, &nonce).apply(&mut buf);
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn keystream_matches_known_answer() {
        // First keystream bytes of ChaCha20 under an all-zero key and nonce.
        let mut buf = [0u8; 8];
        KeyStream::new(&[0; KEY_LEN], &[0; NONCE_LEN]).apply(&mut buf);

        assert_eq!(buf, [0x76, 0xb8, 0xe0, 0xad, 0xa0, 0xf1, 0x3d, 0x90]);
    }

    #[test]
    fn keystream_position_advances() {
        let nonce = [1; NONCE_LEN];

        let mut sequential = [0u8; 16];
        KeyStream::new(&KEY, &nonce).apply(&mut sequential);

        let mut split = [0u8; 16];
        let mut stream = KeyStream::new(&KEY, &nonce);
        stream.apply(&mut split[..5]);
        stream.apply(&mut split[5..]);

        assert_eq!(sequential, split);
    }

    #[test]
    fn session_nonces_differ_in_low_bits_only() {
        let nonce = [0xff; NONCE_LEN];
        let (rx, tx) = session_nonces(&nonce, 0x0123_4567_89ab_cdef);

        assert_eq!(rx[0] & 0x03, 0x00);
        assert_eq!(tx[0] & 0x03, 0x03);
        assert_eq!(rx[0] | 0x03, tx[0]);
        assert_eq!(rx[1..], tx[1..]);
    }

    #[test]
    fn session_nonces_mix_in_the_time() {
        let nonce = [0; NONCE_LEN];
        let now = 0x0807_0605_0403_0201;

        let (rx, _) = session_nonces(&nonce, now);

        // Little-endian time bytes, low 2 bits of the first byte cleared.
        assert_eq!(rx, [0x00, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn nonces_are_distinct() {
        let mut seen = HashSet::with_capacity(1 << 20);
        let mut nonces = NonceSeq::with_bootstrap(&KEY, [0; NONCE_LEN]);

        for _ in 0..(1 << 20) {
            assert!(seen.insert(nonces.next_nonce()));
        }
    }

    #[test]
    fn nonces_differ_across_bootstraps() {
        let mut a = NonceSeq::with_bootstrap(&KEY, [0; NONCE_LEN]);
        let mut b = NonceSeq::with_bootstrap(&KEY, [1; NONCE_LEN]);

        assert_ne!(a.next_nonce(), b.next_nonce());
    }

    #[test]
    fn ct_equal_matches_equality() {
        assert!(ct_equal(b"same bytes", b"same bytes"));
        assert!(!ct_equal(b"same bytes", b"same bytez"));
        assert!(!ct_equal(b"short", b"longer than that"));
        assert!(ct_equal(b"", b""));
    }
}
