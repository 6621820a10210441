/*! Request/response latency statistics */

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
use std::time::{Duration, Instant};

/// The four request/response families whose latencies are tracked
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsGroup {
    /// Local AT commands, keyed by API frame id.
    FrameLocal,
    /// Remote AT commands and transmit statuses, keyed by API frame id.
    FrameRemote,
    /// Outbound application chunks, keyed by XBeeBoot sequence.
    Transmit,
    /// Inbound application chunks, keyed by XBeeBoot sequence.
    Receive,
}

pub const STATS_GROUPS: usize = 4;

impl StatsGroup {
    fn index(self) -> usize {
        match self {
            StatsGroup::FrameLocal => 0,
            StatsGroup::FrameRemote => 1,
            StatsGroup::Transmit => 2,
            StatsGroup::Receive => 3,
        }
    }

    fn name(self) -> &'static str {
        match self {
            StatsGroup::FrameLocal => "FRAME_LOCAL",
            StatsGroup::FrameRemote => "FRAME_REMOTE",
            StatsGroup::Transmit => "TRANSMIT",
            StatsGroup::Receive => "RECEIVE",
        }
    }
}

/// Aggregate of observed delays within one group.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSummary {
    minimum: Duration,
    maximum: Duration,
    sum: Duration,
    samples: u64,
}

impl StatsSummary {
    pub fn add(&mut self, sample: Duration) {
        self.sum += sample;
        if self.samples == 0 || sample < self.minimum {
            self.minimum = sample;
        }
        if sample > self.maximum {
            self.maximum = sample;
        }
        self.samples += 1;
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn minimum(&self) -> Duration {
        self.minimum
    }

    pub fn maximum(&self) -> Duration {
        self.maximum
    }

    /// Mean delay, or `None` before the first sample.
    pub fn average(&self) -> Option<Duration> {
        if self.samples == 0 {
            None
        } else {
            Some(self.sum / self.samples as u32)
        }
    }
}

/// Send timestamps per (group, sequence), plus per-group summaries.
///
/// Semantically a map from (group, 8-bit sequence) to the send time;
/// kept as a flat fixed-size table since sequences are dense.
pub struct Stats {
    send_times: [[Option<Instant>; 256]; STATS_GROUPS],
    summaries: [StatsSummary; STATS_GROUPS],
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            send_times: [[None; 256]; STATS_GROUPS],
            summaries: [StatsSummary::default(); STATS_GROUPS],
        }
    }

    /// Record the send time of a sequenced request.
    pub fn record_send(&mut self, group: StatsGroup, sequence: u8, when: Instant, detail: &str) {
        trace!(
            "stats: send group {} sequence {} {}",
            group.name(),
            sequence,
            detail
        );
        self.send_times[group.index()][usize::from(sequence)] = Some(when);
    }

    /// Record the matching receive; folds the delay into the group
    /// summary when the send time is known.
    pub fn record_receive(&mut self, group: StatsGroup, sequence: u8, when: Instant, detail: &str) {
        if let Some(sent) = self.send_times[group.index()][usize::from(sequence)] {
            let delay = when.saturating_duration_since(sent);
            trace!(
                "stats: receive group {} sequence {} delay {:?} {}",
                group.name(),
                sequence,
                delay,
                detail
            );
            self.summaries[group.index()].add(delay);
        }
    }

    pub fn summary(&self, group: StatsGroup) -> &StatsSummary {
        &self.summaries[group.index()]
    }

    /// Emit all four group summaries to the log.
    pub fn summarise(&self) {
        for group in &[
            StatsGroup::FrameLocal,
            StatsGroup::FrameRemote,
            StatsGroup::Transmit,
            StatsGroup::Receive,
        ] {
            let summary = self.summary(*group);
            if summary.samples() == 0 {
                info!("statistics for {}: no samples", group.name());
                continue;
            }
            info!(
                "statistics for {}: min {:?} max {:?} avg {:?} over {} samples",
                group.name(),
                summary.minimum(),
                summary.maximum(),
                summary.average().unwrap(),
                summary.samples()
            );
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
