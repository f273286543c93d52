//! Input history and timing feedback.
//!
//! Input itself comes from the game layer as an opaque `Vec<i32>`. This
//! module remembers what was sent for which predicted tick and tracks how
//! early inputs arrive at the server.

use std::collections::VecDeque;
use std::time::Instant;

/// Number of sent inputs remembered per session.
pub const INPUT_HISTORY: usize = 200;

/// Number of timing samples the stability score looks at.
const TIMING_SAMPLES: usize = 16;

/// One input sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct SentInput {
    pub tick: i32,
    pub data: Vec<i32>,
    pub sent_at: Instant,
}

#[derive(Debug, Default)]
pub struct InputHistory {
    entries: VecDeque<SentInput>,
    /// Server-reported margins, milliseconds.
    margins: VecDeque<i32>,
}

impl InputHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tick: i32, data: Vec<i32>, sent_at: Instant) {
        if self.entries.len() == INPUT_HISTORY {
            self.entries.pop_front();
        }
        self.entries.push_back(SentInput {
            tick,
            data,
            sent_at,
        });
    }

    /// Input sent for `tick`, if still remembered.
    pub fn get(&self, tick: i32) -> Option<&SentInput> {
        self.entries.iter().rev().find(|e| e.tick == tick)
    }

    pub fn last(&self) -> Option<&SentInput> {
        self.entries.back()
    }

    /// Predicted tick of the last sent input, `-1` if none.
    pub fn last_tick(&self) -> i32 {
        self.last().map_or(-1, |e| e.tick)
    }

    /// Whether `data` should be sent for `tick`: changed input always,
    /// unchanged input only when `force` is set.
    pub fn should_send(&self, data: &[i32], force: bool) -> bool {
        force || self.last().map_or(true, |e| e.data != data)
    }

    /// Records the server's report for the input sent for `tick`.
    pub fn on_timing(&mut self, tick: i32, time_left_ms: i32) {
        if self.get(tick).is_none() {
            return;
        }
        if self.margins.len() == TIMING_SAMPLES {
            self.margins.pop_front();
        }
        self.margins.push_back(time_left_ms);
    }

    /// Standard deviation of recent input margins, in milliseconds.
    /// Zero means perfectly steady arrival.
    pub fn margin_stability_score(&self) -> f32 {
        if self.margins.len() < 2 {
            return 0.0;
        }
        let n = self.margins.len() as f32;
        let mean = self.margins.iter().map(|&m| m as f32).sum::<f32>() / n;
        let var = self
            .margins
            .iter()
            .map(|&m| (m as f32 - mean).powi(2))
            .sum::<f32>()
            / n;
        var.sqrt()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.margins.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded() {
        let mut h = InputHistory::new();
        let now = Instant::now();
        for tick in 0..(INPUT_HISTORY as i32 + 10) {
            h.push(tick, vec![tick], now);
        }
        assert_eq!(h.len(), INPUT_HISTORY);
        assert!(h.get(5).is_none());
        assert_eq!(h.get(205).map(|e| e.data.clone()), Some(vec![205]));
    }

    #[test]
    fn unchanged_input_needs_force() {
        let mut h = InputHistory::new();
        assert!(h.should_send(&[1, 2], false));
        h.push(10, vec![1, 2], Instant::now());
        assert!(!h.should_send(&[1, 2], false));
        assert!(h.should_send(&[1, 2], true));
        assert!(h.should_send(&[1, 3], false));
    }

    #[test]
    fn stability_score_from_margins() {
        let mut h = InputHistory::new();
        let now = Instant::now();
        h.push(1, vec![], now);
        h.push(2, vec![], now);
        h.on_timing(1, 10);
        h.on_timing(2, 30);
        h.on_timing(99, 1000);
        assert!((h.margin_stability_score() - 10.0).abs() < 1e-3);
    }
}
