/*! Source-route cache fed by Route Record Indicator frames */

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

use log::*;

/// Maximum intermediate hops we will track.  The radio documentation
/// variously promises 40 (routing table), 25 (firmware 4x58+) or 11
/// (older firmware); routes longer than the table limit are ignored.
pub const MAX_INTERMEDIATE_HOPS: usize = 40;

/// The current source route to the target, as learned from 0xA1 Route
/// Record Indicators.
///
/// Hops are 16-bit intermediate addresses ordered nearest-to-target
/// first.  While unset, routing is inert: no hop overhead is charged
/// against the chunk budget and no Create Source Route frame is due.
#[derive(Debug, Default)]
pub struct SourceRoute {
    hops: Option<Vec<u16>>,
    changed: bool,
}

impl SourceRoute {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a route reported by a Route Record Indicator.  Marks the
    /// route changed only when it actually differs from the cached one.
    pub fn observe(&mut self, hops: &[u16]) {
        if hops.len() > MAX_INTERMEDIATE_HOPS {
            return;
        }
        if self.hops.as_deref() != Some(hops) {
            debug!("source route has changed: {} hops", hops.len());
            self.hops = Some(hops.to_vec());
            self.changed = true;
        }
    }

    /// Number of intermediate hops; zero while the route is unset.
    pub fn hop_count(&self) -> usize {
        self.hops.as_ref().map_or(0, |h| h.len())
    }

    /// The hop addresses as wire bytes (big-endian, nearest-to-target
    /// first), or empty while unset.
    pub fn wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.hop_count() * 2);
        if let Some(hops) = &self.hops {
            for hop in hops {
                out.extend_from_slice(&hop.to_be_bytes());
            }
        }
        out
    }

    /// True when the next addressed API call must be preceded by a
    /// Create Source Route frame.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Called once the Create Source Route frame has been emitted.
    pub fn clear_changed(&mut self) {
        self.changed = false;
    }
}
