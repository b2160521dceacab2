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

use crate::conn::{PeerMode, INSTALL_NAME_LEN, MAX_JUNK};
use crate::crypto::KEY_LEN;
use crate::ConfigError;

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// An `EndpointConfig` contains the identity and wiring of this endpoint:
/// the shared key, the peer address, the handshake parameters and the
/// capture and error reporting settings.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// The shared 32-byte tunnel key. Bytes after the 32nd are ignored,
    /// a shorter key is refused.
    pub key: Vec<u8>,
    /// The peer address. A leading `l` listens on the remainder,
    /// a leading `c` connects to it, e.g. `l0.0.0.0` or `c192.0.2.7`.
    pub addr: String,
    /// The peer TCP port.
    pub port: u16,
    /// Seconds to sleep between sessions.
    #[serde(default = "default_sleep")]
    pub sleep_secs: i64,
    /// The number of cover bytes the peer sends ahead of the handshake.
    #[serde(default = "default_junk")]
    pub junk_size: i64,
    /// A unique identifier of this deployment, used as the handshake
    /// challenge. Compared over a zero-padded buffer of
    /// [`INSTALL_NAME_LEN`] bytes, so only the part up to the first zero
    /// byte is meaningful.
    pub install_name: String,
    /// The environment variable receiving the last session error code.
    #[serde(default = "default_error_var")]
    pub error_var: String,
    /// The width of the zero-padded error code.
    #[serde(default = "default_error_width")]
    pub error_width: usize,
    /// Socket send/receive timeout in seconds. Zero disables the timeouts.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    /// The interface to capture from and inject into.
    pub interface: String,
    /// Capture snapshot length in bytes.
    #[serde(default = "default_snaplen")]
    pub snaplen: i32,
    /// BPF filter installed before any packet is delivered. Empty for none.
    #[serde(default)]
    pub filter: String,
}

fn default_sleep() -> i64 {
    1
}

fn default_junk() -> i64 {
    16
}

fn default_error_var() -> String {
    "SYS".to_string()
}

fn default_error_width() -> usize {
    2
}

fn default_io_timeout() -> u64 {
    2
}

fn default_snaplen() -> i32 {
    65535
}

impl EndpointConfig {
    pub const PATH: &'static str = "/etc/tapline.conf";

    /// Loads the configuration file of the current machine.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::PATH)
    }

    /// Loads the configuration from the specified path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut f = File::open(path)?;

        if f.metadata()?.permissions().mode() & 0o7077 > 0 {
            return Err(ConfigError::InsecurePerms);
        }

        let mut s = String::new();
        f.read_to_string(&mut s)?;

        Ok(toml::from_str(&s)?)
    }

    /// Saves the configuration to the configuration file on the current machine.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::PATH)
    }

    /// Saves the configuration to the specified path.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let s = toml::to_string_pretty(self)?;

        let mut f = OpenOptions::new()
            .create(true)
            .read(false)
            .write(true)
            .append(false)
            .truncate(true)
            .mode(0o0600)
            .open(path)?;

        write!(f, "{}", s)?;
        Ok(())
    }

    /// Enforces the startup invariants and returns the validated [`Profile`]
    /// the supervisor runs on.
    pub fn validate(&self) -> Result<Profile, ConfigError> {
        if self.key.len() < KEY_LEN {
            return Err(ConfigError::InvalidKey);
        }
        let mut key = [0; KEY_LEN];
        key.copy_from_slice(&self.key[..KEY_LEN]);

        let mode = match self.addr.chars().next() {
            Some('l') => PeerMode::Listen,
            Some('c') => PeerMode::Connect,
            _ => return Err(ConfigError::UnknownMode),
        };
        let host = self.addr[1..].to_string();

        if self.sleep_secs < 0 {
            return Err(ConfigError::InvalidSleep);
        }

        if self.junk_size < 0 || self.junk_size as usize > MAX_JUNK {
            return Err(ConfigError::InvalidJunk);
        }

        let name = self.install_name.as_bytes();
        if name.is_empty() || name.len() > INSTALL_NAME_LEN {
            return Err(ConfigError::InvalidInstallName);
        }
        let mut install_name = Box::new([0; INSTALL_NAME_LEN]);
        install_name[..name.len()].copy_from_slice(name);

        Ok(Profile {
            key,
            mode,
            host,
            port: self.port,
            sleep: Duration::from_secs(self.sleep_secs as u64),
            io_timeout: Duration::from_secs(self.io_timeout_secs),
            junk_size: self.junk_size as usize,
            install_name,
            capture: CaptureSettings {
                interface: self.interface.clone(),
                snaplen: self.snaplen,
                filter: self.filter.clone(),
            },
            report: ReportSettings {
                variable: self.error_var.clone(),
                width: self.error_width,
            },
        })
    }
}

/// A `Profile` is the validated, immutable view of an [`EndpointConfig`]:
/// the key is exactly [`KEY_LEN`] bytes, the mode letter has been resolved
/// and the install name is padded to its full comparison length.
#[derive(Clone, Debug)]
pub struct Profile {
    /// The shared tunnel key.
    pub key: [u8; KEY_LEN],
    /// Whether to listen for the peer or to call out to it.
    pub mode: PeerMode,
    /// The peer host, without the mode letter.
    pub host: String,
    /// The peer TCP port.
    pub port: u16,
    /// Time to sleep between sessions.
    pub sleep: Duration,
    /// Socket send/receive timeout. Zero disables the timeouts.
    pub io_timeout: Duration,
    /// The number of cover bytes to drain ahead of the handshake.
    pub junk_size: usize,
    /// The install name, zero-padded to [`INSTALL_NAME_LEN`] bytes.
    pub install_name: Box<[u8; INSTALL_NAME_LEN]>,
    /// Capture backend settings.
    pub capture: CaptureSettings,
    /// Error reporting settings.
    pub report: ReportSettings,
}

impl Profile {
    /// Returns the logical install name: the padded buffer up to its first
    /// zero byte.
    pub fn install_name_logical(&self) -> &[u8] {
        let end = self
            .install_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(INSTALL_NAME_LEN);

        &self.install_name[..end]
    }
}

/// Settings of the link-layer capture backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CaptureSettings {
    /// The interface to capture from and inject into.
    pub interface: String,
    /// Capture snapshot length in bytes.
    pub snaplen: i32,
    /// BPF filter installed before any packet is delivered. Empty for none.
    pub filter: String,
}

/// Settings of the error report sink.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReportSettings {
    /// The environment variable receiving the last session error code.
    pub variable: String,
    /// The width of the zero-padded error code.
    pub width: usize,
}
