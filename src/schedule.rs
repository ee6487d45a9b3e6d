//! Target timestamp selection.
//!
//! [`FrameSchedule`] converts a track duration and a sampling interval into
//! the ordered list of composition timestamps (in track ticks) at which a
//! frame should be emitted, and answers whether a given sample timestamp
//! falls inside the match window of one of those targets.

use std::time::Duration;

/// Samples are matched against a target if they land within one frame at
/// this rate after it.
const MATCH_WINDOW_FPS: f64 = 30.0;

/// How often a single target may produce a frame.
///
/// The default differs from the naive window test, which emits once per
/// matching sample and can repeat a target when samples are denser than
/// 30 fps. [`MatchPolicy::EveryMatch`] restores that behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    /// Only the first sample that decodes to a picture inside a target's
    /// window is emitted.
    #[default]
    FirstPerTarget,
    /// Every sample inside a target's window is emitted.
    EveryMatch,
}

/// The target timestamps of one request plus their claim state.
#[derive(Debug, Clone)]
pub struct FrameSchedule {
    targets: Vec<i64>,
    claimed: Vec<bool>,
    window: f64,
    policy: MatchPolicy,
}

/// Compute `floor(k * interval * time_base)` for every `k` with
/// `k * interval < duration`.
///
/// Returns an empty list when the duration, time base, or interval is not
/// positive. A duration shorter than the interval yields the single
/// timestamp `0`.
pub fn target_timestamps(duration_ticks: u64, time_base: u32, interval: Duration) -> Vec<i64> {
    let interval = interval.as_secs_f64();
    if time_base == 0 || duration_ticks == 0 || interval <= 0.0 {
        return Vec::new();
    }

    let time_base = time_base as f64;
    let duration = duration_ticks as f64 / time_base;
    let mut targets = Vec::with_capacity((duration / interval).ceil() as usize);
    let mut k: u64 = 0;
    loop {
        let seconds = k as f64 * interval;
        if seconds >= duration {
            break;
        }
        let tick = (seconds * time_base).floor() as i64;
        // Sub-tick intervals can map two k values onto the same tick.
        if targets.last().is_none_or(|&last| tick > last) {
            targets.push(tick);
        }
        k += 1;
    }
    targets
}

impl FrameSchedule {
    /// Build the schedule for a track.
    pub fn new(duration_ticks: u64, time_base: u32, interval: Duration, policy: MatchPolicy) -> Self {
        let targets = target_timestamps(duration_ticks, time_base, interval);
        let claimed = vec![false; targets.len()];
        Self {
            targets,
            claimed,
            window: time_base as f64 / MATCH_WINDOW_FPS,
            policy,
        }
    }

    /// The target timestamps in ticks, strictly increasing.
    pub fn targets(&self) -> &[i64] {
        &self.targets
    }

    /// Returns `true` if there are no targets.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Number of targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Find the target whose window `[ts, ts + time_base/30)` contains
    /// `timestamp` and which may still emit.
    pub fn match_target(&self, timestamp: i64) -> Option<usize> {
        let end = self.targets.partition_point(|&ts| ts <= timestamp);
        // Windows only overlap when the interval is shorter than one frame.
        let start = self.targets[..end]
            .partition_point(|&ts| (timestamp as f64) >= ts as f64 + self.window);

        match self.policy {
            MatchPolicy::FirstPerTarget => (start..end).find(|&index| !self.claimed[index]),
            MatchPolicy::EveryMatch => (start < end).then_some(start),
        }
    }

    /// Record that target `index` produced a frame.
    pub fn claim(&mut self, index: usize) {
        if let Some(slot) = self.claimed.get_mut(index) {
            *slot = true;
        }
    }

    /// Number of targets that produced at least one frame.
    pub fn claimed_count(&self) -> usize {
        self.claimed.iter().filter(|&&claimed| claimed).count()
    }
}
