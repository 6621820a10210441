/*! Error types for the XBeeBoot transport */

/*
    Copyright (C) 2020  John Goerzen <jgoerzen@complete.org

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License
    along with this program.  If not, see <http://www.gnu.org/licenses/>.

*/

use std::io;
use thiserror::Error;

/// Errors surfaced by the XBeeBoot transport.
///
/// Malformed frames are never surfaced: the codec discards them silently
/// and the retry layers absorb the resulting timeouts.
#[derive(Error, Debug)]
pub enum XbbError {
    /// The port specification did not contain a usable XBee address.
    #[error("bad XBee address: require a 16-character hexadecimal address before '@'")]
    BadAddress,

    /// A configuration parameter was out of range.
    #[error("bad configuration: {0}")]
    BadConfig(String),

    /// Serial read/write failure, including receive timeouts.
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),

    /// The remote XBee reported an AT command failure.
    #[error("{}", remote_at_message(.0))]
    RemoteAt(u8),

    /// The transport failed mid-send and cannot be trusted any further.
    #[error("transport is unusable after an earlier failure")]
    TransportUnusable,
}

/// Result alias used throughout the crate.
pub type XbbResult<T> = Result<T, XbbError>;

fn remote_at_message(status: &u8) -> String {
    match *status {
        1 => "error communicating with remote XBee".to_string(),
        2 => "remote XBee command error: invalid command".to_string(),
        3 => "remote XBee command error: invalid parameter".to_string(),
        4 => "remote XBee error: transmission failure".to_string(),
        other => format!("unrecognised remote XBee error code {}", other),
    }
}

impl XbbError {
    /// A serial receive timeout, as produced by the retry layers.
    pub fn timeout(detail: &str) -> XbbError {
        XbbError::Io(io::Error::new(io::ErrorKind::TimedOut, detail.to_string()))
    }

    /// True when this error is a receive timeout that a retry loop may
    /// absorb, as opposed to a terminal failure.
    pub fn is_timeout(&self) -> bool {
        match self {
            XbbError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}
