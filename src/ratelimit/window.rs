//! Sliding window model.
//!
//! A bucket approximates a continuous rolling window with two fixed windows:
//! the one containing the decision time (current) and the one before it
//! (previous), whose count is weighted by how much of it still overlaps the
//! rolling window.

use std::collections::BTreeMap;

use serde::Serialize;

/// A fixed time slice counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Window {
    /// `floor(time / duration)`; also the window's origin sub-key
    pub sequence: i64,
    /// Start in epoch milliseconds, aligned to `duration`
    pub start: i64,
    /// Length in milliseconds
    pub duration: i64,
    /// Cost admitted into this window as far as this node knows
    pub counter: i64,
}

impl Window {
    pub fn new(sequence: i64, duration: i64) -> Self {
        Self {
            sequence,
            start: sequence * duration,
            duration,
            counter: 0,
        }
    }

    pub fn end(&self) -> i64 {
        self.start.saturating_add(self.duration)
    }

    /// Raise the local count to what the origin knows; local counts never go down.
    pub fn merge_origin(&mut self, origin: i64) {
        self.counter = self.counter.max(origin);
    }
}

/// Sequence number of the window containing `time`.
pub fn sequence_for(time: i64, duration: i64) -> i64 {
    time.div_euclid(duration)
}

/// Result of evaluating one request against a bucket's windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub exceeded: bool,
    /// Weighted count including the evaluated cost
    pub effective: i64,
    /// `max(0, limit - effective)`
    pub remaining: i64,
}

/// Evaluate the sliding window formula.
///
/// `effective = current + previous * (1 - elapsed / duration) + pending + cost`,
/// where `pending` is cost reserved earlier in the same batch. Zero-cost
/// requests never exceed. The sum saturates, so an oversized cost is denied.
pub fn calculate_rate_limit(
    limit: i64,
    cost: i64,
    pending: i64,
    time: i64,
    current: &Window,
    previous: Option<&Window>,
) -> Evaluation {
    let elapsed = (time - current.start) as f64 / current.duration as f64;
    let elapsed = elapsed.clamp(0.0, 1.0);

    let weighted_previous = previous
        .map(|w| (w.counter as f64 * (1.0 - elapsed)) as i64)
        .unwrap_or(0);

    let effective = current
        .counter
        .saturating_add(weighted_previous)
        .saturating_add(pending)
        .saturating_add(cost);

    Evaluation {
        exceeded: cost > 0 && effective > limit,
        effective,
        remaining: (limit - effective).max(0),
    }
}

/// Mutable state of one bucket; guarded by the bucket's lock.
#[derive(Debug, Default)]
pub struct BucketState {
    windows: BTreeMap<i64, Window>,
    /// Until this time (epoch ms) decisions consult the origin
    strict_until: i64,
    /// Set by the sweep when the bucket leaves the registry
    evicted: bool,
    /// Windows dropped on the hot path since the last sweep
    pruned: u64,
}

impl BucketState {
    /// Window containing `time`, and whether it already existed.
    pub fn current_window(&mut self, time: i64, duration: i64) -> (&mut Window, bool) {
        self.window(sequence_for(time, duration), duration)
    }

    /// Window before the one containing `time`, and whether it already existed.
    pub fn previous_window(&mut self, time: i64, duration: i64) -> (&mut Window, bool) {
        self.window(sequence_for(time, duration) - 1, duration)
    }

    fn window(&mut self, sequence: i64, duration: i64) -> (&mut Window, bool) {
        let existed = self.windows.contains_key(&sequence);
        if !existed {
            // Only the newest window and its predecessor are ever needed
            let newest = self
                .windows
                .keys()
                .next_back()
                .map_or(sequence, |&s| s.max(sequence));
            let before = self.windows.len();
            self.windows.retain(|&s, _| s >= newest - 1);
            self.pruned += (before - self.windows.len()) as u64;
        }

        let window = self
            .windows
            .entry(sequence)
            .or_insert_with(|| Window::new(sequence, duration));
        (window, existed)
    }

    pub fn get(&self, sequence: i64) -> Option<&Window> {
        self.windows.get(&sequence)
    }

    /// Sequences (current, previous) that must be refreshed from the origin
    /// before a decision at `time` can be trusted.
    pub fn refresh_targets(&self, time: i64, duration: i64) -> Vec<i64> {
        let sequence = sequence_for(time, duration);
        let strict = self.is_strict(time);
        [sequence, sequence - 1]
            .into_iter()
            .filter(|s| strict || !self.windows.contains_key(s))
            .collect()
    }

    pub fn is_strict(&self, time: i64) -> bool {
        time < self.strict_until
    }

    pub fn mark_strict(&mut self, until: i64) {
        self.strict_until = self.strict_until.max(until);
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    pub fn mark_evicted(&mut self) {
        self.evicted = true;
    }

    pub fn windows(&self) -> impl Iterator<Item = &Window> {
        self.windows.values()
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Drop windows that ended more than one window plus `grace` ago.
    /// Returns the number of windows removed, including hot-path pruning.
    pub fn evict_stale(&mut self, now: i64, grace: i64) -> u64 {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| w.end().saturating_add(w.duration).saturating_add(grace) > now);
        let evicted = (before - self.windows.len()) as u64 + self.pruned;
        self.pruned = 0;
        evicted
    }

    /// No windows left and no strict period pending.
    pub fn is_idle(&self, now: i64) -> bool {
        self.windows.is_empty() && !self.is_strict(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: i64 = 60_000;

    #[test]
    fn test_window_alignment() {
        let w = Window::new(sequence_for(125_000, MINUTE), MINUTE);
        assert_eq!(w.sequence, 2);
        assert_eq!(w.start, 120_000);
        assert_eq!(w.end(), 180_000);
    }

    #[test]
    fn test_merge_origin_takes_max() {
        let mut w = Window::new(0, MINUTE);
        w.counter = 5;
        w.merge_origin(3);
        assert_eq!(w.counter, 5);
        w.merge_origin(9);
        assert_eq!(w.counter, 9);
    }

    #[test]
    fn test_calculate_current_only() {
        let mut current = Window::new(0, MINUTE);
        current.counter = 3;

        let eval = calculate_rate_limit(5, 1, 0, 10_000, &current, None);
        assert_eq!(eval, Evaluation { exceeded: false, effective: 4, remaining: 1 });

        let eval = calculate_rate_limit(5, 3, 0, 10_000, &current, None);
        assert_eq!(eval, Evaluation { exceeded: true, effective: 6, remaining: 0 });
    }

    #[test]
    fn test_calculate_weights_previous_window() {
        let mut previous = Window::new(0, MINUTE);
        previous.counter = 10;
        let mut current = Window::new(1, MINUTE);
        current.counter = 2;

        // 25% into the current window: 75% of the previous count still applies
        let eval = calculate_rate_limit(20, 1, 0, MINUTE + 15_000, &current, Some(&previous));
        assert_eq!(eval.effective, 2 + 7 + 1);
        assert_eq!(eval.remaining, 10);

        // At the very start the whole previous window counts
        let eval = calculate_rate_limit(20, 1, 0, MINUTE, &current, Some(&previous));
        assert_eq!(eval.effective, 13);
    }

    #[test]
    fn test_calculate_pending_and_zero_cost() {
        let mut current = Window::new(0, MINUTE);
        current.counter = 5;

        let eval = calculate_rate_limit(5, 0, 0, 0, &current, None);
        assert!(!eval.exceeded);
        assert_eq!(eval.remaining, 0);

        current.counter = 8;
        let eval = calculate_rate_limit(5, 0, 0, 0, &current, None);
        assert!(!eval.exceeded);

        current.counter = 1;
        let eval = calculate_rate_limit(5, 2, 2, 0, &current, None);
        assert_eq!(eval.effective, 5);
        assert!(!eval.exceeded);
    }

    #[test]
    fn test_calculate_saturates_huge_cost() {
        let mut current = Window::new(0, MINUTE);
        current.counter = 1;

        let eval = calculate_rate_limit(5, i64::MAX, 3, 0, &current, None);
        assert!(eval.exceeded);
        assert_eq!(eval.effective, i64::MAX);
        assert_eq!(eval.remaining, 0);
    }

    #[test]
    fn test_evict_stale_with_huge_grace() {
        let mut state = BucketState::default();
        state.current_window(0, MINUTE);
        assert_eq!(state.evict_stale(10 * MINUTE, i64::MAX), 0);
        assert_eq!(state.window_count(), 1);
    }

    #[test]
    fn test_elapsed_fraction_is_clamped() {
        let mut previous = Window::new(0, MINUTE);
        previous.counter = 10;
        let current = Window::new(1, MINUTE);

        // A time before the window start behaves like the window start
        let eval = calculate_rate_limit(100, 1, 0, 0, &current, Some(&previous));
        assert_eq!(eval.effective, 11);

        // A time past the window end ignores the previous window entirely
        let eval = calculate_rate_limit(100, 1, 0, 3 * MINUTE, &current, Some(&previous));
        assert_eq!(eval.effective, 1);
    }

    #[test]
    fn test_lazy_window_creation() {
        let mut state = BucketState::default();

        let (w, existed) = state.current_window(61_000, MINUTE);
        assert!(!existed);
        w.counter = 4;

        let (w, existed) = state.current_window(119_999, MINUTE);
        assert!(existed);
        assert_eq!(w.counter, 4);

        let (w, existed) = state.previous_window(61_000, MINUTE);
        assert!(!existed);
        assert_eq!(w.sequence, 0);
        assert_eq!(state.window_count(), 2);
    }

    #[test]
    fn test_rotation_keeps_two_windows() {
        let mut state = BucketState::default();
        state.current_window(0, MINUTE);
        state.current_window(MINUTE, MINUTE);
        state.current_window(2 * MINUTE, MINUTE);

        let sequences: Vec<i64> = state.windows().map(|w| w.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(state.evict_stale(2 * MINUTE, 0), 1);
    }

    #[test]
    fn test_refresh_targets() {
        let mut state = BucketState::default();
        assert_eq!(state.refresh_targets(MINUTE, MINUTE), vec![1, 0]);

        state.current_window(MINUTE, MINUTE);
        assert_eq!(state.refresh_targets(MINUTE, MINUTE), vec![0]);

        state.previous_window(MINUTE, MINUTE);
        assert!(state.refresh_targets(MINUTE, MINUTE).is_empty());

        state.mark_strict(2 * MINUTE);
        assert_eq!(state.refresh_targets(MINUTE, MINUTE), vec![1, 0]);
        assert!(state.refresh_targets(2 * MINUTE, MINUTE).len() == 1);
    }

    #[test]
    fn test_evict_stale_and_idle() {
        let mut state = BucketState::default();
        state.current_window(0, MINUTE);
        state.mark_strict(MINUTE);

        // Still the previous window during the next minute
        assert_eq!(state.evict_stale(MINUTE + 30_000, 0), 0);
        assert!(!state.is_idle(MINUTE - 1));

        assert_eq!(state.evict_stale(2 * MINUTE, 0), 1);
        assert!(state.is_idle(2 * MINUTE));
    }
}
