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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(#[from] tapline_common::ConfigError),

    #[error("Unable to set signal handler: {0}")]
    Ctrlc(#[from] ctrlc::Error),
}

impl Error {
    /// Returns the process exit code: configuration errors carry their own
    /// reserved codes, everything else is a generic failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(e) => e.code(),
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
