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

use std::io;

use thiserror::Error;

/// A `ConfigError` indicates an unusable endpoint configuration.
/// These errors are fatal: the process refuses to start
/// and exits with the code returned by [`ConfigError::code`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The peer address does not begin with `l` (listen) or `c` (connect).
    #[error("Peer address must begin with 'l' or 'c'")]
    UnknownMode,
    /// The sleep interval is negative.
    #[error("Invalid sleep interval")]
    InvalidSleep,
    /// The junk size is negative or exceeds [`crate::conn::MAX_JUNK`].
    #[error("Junk size out of range")]
    InvalidJunk,
    /// The key is shorter than [`crate::crypto::KEY_LEN`] bytes.
    #[error("Key is shorter than 32 bytes")]
    InvalidKey,
    /// The install name is empty or longer than
    /// [`crate::conn::INSTALL_NAME_LEN`] bytes.
    #[error("Install name is empty or too long")]
    InvalidInstallName,

    /// The permissions on the configuration file are insecure.
    #[error("Insecure config permissions (limit access to root user!)")]
    InsecurePerms,

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// A `toml::ser::Error` TOML serialization error occured.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    /// A `toml::de::Error` TOML deserialization error occured.
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

impl ConfigError {
    /// Returns the process exit code reserved for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::UnknownMode => -1,
            Self::InvalidSleep => -2,
            Self::InvalidJunk => -9,
            Self::InvalidKey => -12,
            Self::InvalidInstallName => -19,
            Self::IoError(_) => -30,
            Self::TomlSer(_) | Self::TomlDe(_) => -31,
            Self::InsecurePerms => -32,
        }
    }
}

/// A `SessionError` indicates the failure of a single tunnel session.
/// It may be a low-level connection issue or a high-level protocol error.
///
/// Session errors are transient: the supervisor records the code
/// through the report sink and retries after the configured sleep.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The peer host and port did not resolve to any usable address.
    #[error("Unable to resolve peer address")]
    AddressResolve,
    /// No candidate address could be turned into a listening socket.
    #[error("Unable to listen for the peer")]
    Listen,
    /// Accepting the peer connection failed.
    #[error("Unable to accept peer connection: {0}")]
    Accept(#[source] io::Error),
    /// No candidate address accepted the connection.
    #[error("Unable to connect to the peer")]
    Connect,
    /// Setting the socket send or receive timeout failed.
    #[error("Unable to set socket timeouts: {0}")]
    SetTimeout(#[source] io::Error),
    /// The system clock reads before the Unix epoch.
    #[error("System clock is unusable")]
    Clock,

    /// Draining the peer's initial cover bytes failed or came up short.
    #[error("Unable to read cover bytes")]
    JunkRead,
    /// Sending the session nonce failed.
    #[error("Unable to send the session nonce")]
    NonceSend,
    /// Receiving the install name failed.
    #[error("Unable to receive the install name")]
    InstallNameRecv,
    /// The received install name does not match the configured one.
    #[error("Received install name is wrong")]
    InstallNameMismatch,
    /// Echoing the install name back failed.
    #[error("Unable to echo the install name")]
    InstallNameEcho,

    /// A send did not deliver all of its bytes.
    #[error("Unable to send all data")]
    Send,
    /// A receive failed or timed out.
    #[error("Unable to receive all data")]
    Recv,
    /// The peer closed the connection.
    #[error("Peer disconnected")]
    Disconnect,
    /// The received and computed frame digests differ.
    #[error("Frame digest mismatch")]
    HashMismatch,

    /// The capture loop or the injector failed.
    #[error("Capture failure: {0}")]
    Capture(String),
    /// A frame was captured only partially.
    #[error("Captured frame is truncated")]
    CaptureTruncated,
    /// A captured frame does not fit into a single tunnel frame.
    #[error("Captured frame exceeds 65535 bytes")]
    CaptureTooLarge,
    /// Opening the capture interface failed.
    #[error("Unable to open capture interface: {0}")]
    CaptureOpen(String),
    /// Compiling or installing the capture filter failed.
    #[error("Unable to set capture filter: {0}")]
    CaptureFilter(String),
}

impl SessionError {
    /// Returns the numeric code recorded through the report sink.
    pub fn code(&self) -> i32 {
        match self {
            Self::AddressResolve => -5,
            Self::Listen => -6,
            Self::Accept(_) => -7,
            Self::Connect => -8,
            Self::JunkRead => -10,
            Self::Clock => -11,
            Self::Send => -13,
            Self::SetTimeout(_) => -14,
            Self::Recv => -16,
            Self::NonceSend => -17,
            Self::InstallNameRecv => -18,
            Self::InstallNameMismatch => -20,
            Self::InstallNameEcho => -21,
            Self::HashMismatch => -22,
            Self::Disconnect => -23,
            Self::Capture(_) => -24,
            Self::CaptureTruncated => -25,
            Self::CaptureTooLarge => -26,
            Self::CaptureOpen(_) => -27,
            Self::CaptureFilter(_) => -28,
        }
    }
}
