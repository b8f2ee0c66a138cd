//! Blink classification over an EAR stream: threshold hysteresis plus a
//! minimum-run debounce.
//!
//! The machine is purely reactive: output depends only on the sequence of
//! samples fed to [`BlinkStateMachine::step`]. Invalid samples (null, ≤ 0,
//! non-finite) never change state.

use crate::types::EarSample;
use serde::{Deserialize, Serialize};

// --- Named constants ---
pub const DEFAULT_EAR_THRESHOLD: f64 = 0.30;
pub const DEFAULT_MIN_CONSECUTIVE_FRAMES: u32 = 4;
pub const DEFAULT_MAX_CONSECUTIVE_FRAMES: u32 = 24;

/// Tuning for [`BlinkStateMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlinkConfig {
    /// Samples strictly below this are classified as closed.
    pub threshold: f64,
    /// Shortest closure run counted as a blink.
    pub min_consecutive_frames: u32,
    /// Run length past which a closure is flagged as prolonged.
    /// Does not end the run; see [`StepOutput::prolonged`].
    pub max_consecutive_frames: u32,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_EAR_THRESHOLD,
            min_consecutive_frames: DEFAULT_MIN_CONSECUTIVE_FRAMES,
            max_consecutive_frames: DEFAULT_MAX_CONSECUTIVE_FRAMES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlinkEventKind {
    Onset,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlinkEvent {
    pub kind: BlinkEventKind,
    pub timestamp: f64,
}

/// Where the machine is between samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlinkState {
    /// Not tracking a closure.
    Open,
    /// Accumulating a run of closed samples.
    Tracking,
}

/// Per-session counters. Reset only when a new session starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlinkSession {
    pub consecutive_closed_frames: u32,
    pub closure_start_time: Option<f64>,
    pub total_blink_count: u64,
}

/// Result of feeding one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    pub ear: Option<f64>,
    pub onset: bool,
    pub end: bool,
    pub total_blink_count: u64,
    pub timestamp: f64,
    /// Seconds from closure onset to the end event; set only when `end`.
    pub closure_duration: Option<f64>,
    /// True on the sample where the run first grows past the configured max.
    pub prolonged: bool,
}

impl StepOutput {
    /// Events carried by this output, onset first.
    pub fn events(&self) -> impl Iterator<Item = BlinkEvent> + '_ {
        let onset = self.onset.then_some(BlinkEvent {
            kind: BlinkEventKind::Onset,
            timestamp: self.timestamp,
        });
        let end = self.end.then_some(BlinkEvent {
            kind: BlinkEventKind::End,
            timestamp: self.timestamp,
        });
        onset.into_iter().chain(end)
    }
}

/// Hysteresis + debounce blink detector.
#[derive(Debug, Clone)]
pub struct BlinkStateMachine {
    config: BlinkConfig,
    session: BlinkSession,
    halted: bool,
}

impl BlinkStateMachine {
    pub fn new(config: BlinkConfig) -> Self {
        Self {
            config,
            session: BlinkSession::default(),
            halted: false,
        }
    }

    pub fn config(&self) -> &BlinkConfig {
        &self.config
    }

    pub fn session(&self) -> &BlinkSession {
        &self.session
    }

    pub fn state(&self) -> BlinkState {
        if self.session.closure_start_time.is_some() {
            BlinkState::Tracking
        } else {
            BlinkState::Open
        }
    }

    pub fn total_blink_count(&self) -> u64 {
        self.session.total_blink_count
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Stop emitting events. Later samples pass through untouched.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    /// Start a fresh session.
    pub fn reset(&mut self) {
        self.session = BlinkSession::default();
        self.halted = false;
    }

    /// Feed one sample and report any transition it caused.
    pub fn step(&mut self, sample: EarSample) -> StepOutput {
        let mut out = StepOutput {
            ear: sample.value,
            onset: false,
            end: false,
            total_blink_count: self.session.total_blink_count,
            timestamp: sample.timestamp,
            closure_duration: None,
            prolonged: false,
        };

        if self.halted {
            return out;
        }
        let Some(ear) = sample.valid_value() else {
            return out;
        };

        if ear < self.config.threshold {
            if self.session.closure_start_time.is_none() {
                self.session.closure_start_time = Some(sample.timestamp);
                out.onset = true;
                tracing::debug!(ear, timestamp = sample.timestamp, "blink onset");
            }
            self.session.consecutive_closed_frames =
                self.session.consecutive_closed_frames.saturating_add(1);

            if Some(self.session.consecutive_closed_frames)
                == self.config.max_consecutive_frames.checked_add(1)
            {
                out.prolonged = true;
                tracing::warn!(
                    frames = self.session.consecutive_closed_frames,
                    max = self.config.max_consecutive_frames,
                    "closure run exceeds max consecutive frames"
                );
            }
        } else if let Some(started) = self.session.closure_start_time.take() {
            let run = std::mem::take(&mut self.session.consecutive_closed_frames);
            if run >= self.config.min_consecutive_frames {
                self.session.total_blink_count += 1;
                out.end = true;
                out.closure_duration = Some(sample.timestamp - started);
                tracing::debug!(run, total = self.session.total_blink_count, "blink end");
            } else {
                tracing::trace!(run, "closure run below debounce, discarded");
            }
        }

        out.total_blink_count = self.session.total_blink_count;
        out
    }
}

impl Default for BlinkStateMachine {
    fn default() -> Self {
        Self::new(BlinkConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(values: &[f64]) -> (BlinkStateMachine, Vec<StepOutput>) {
        let mut machine = BlinkStateMachine::default();
        let outputs = values
            .iter()
            .enumerate()
            .map(|(i, &v)| machine.step(EarSample::new(i as f64 * 0.033, Some(v))))
            .collect();
        (machine, outputs)
    }

    #[test]
    fn test_valid_blink_counts_once() {
        let (machine, out) = run(&[0.35, 0.20, 0.18, 0.15, 0.10, 0.40]);

        assert!(out[1].onset);
        assert!(out.iter().enumerate().all(|(i, o)| o.onset == (i == 1)));
        assert!(out[5].end);
        assert_eq!(out[5].total_blink_count, 1);
        assert!(out[..5].iter().all(|o| !o.end && o.total_blink_count == 0));
        assert_eq!(machine.state(), BlinkState::Open);
        assert_eq!(machine.session().consecutive_closed_frames, 0);
        assert_eq!(machine.session().closure_start_time, None);
    }

    #[test]
    fn test_end_reports_closure_duration() {
        let mut machine = BlinkStateMachine::default();
        for (t, v) in [(10.0, 0.1), (10.1, 0.1), (10.2, 0.1), (10.3, 0.1)] {
            machine.step(EarSample::new(t, Some(v)));
        }
        let out = machine.step(EarSample::new(10.5, Some(0.4)));
        assert!(out.end);
        assert!((out.closure_duration.unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_short_run_is_noise() {
        let (machine, out) = run(&[0.35, 0.10, 0.40]);

        assert!(out[1].onset);
        assert!(!out[2].end);
        assert_eq!(out[2].total_blink_count, 0);
        assert_eq!(machine.state(), BlinkState::Open);
        assert_eq!(machine.session().consecutive_closed_frames, 0);
    }

    #[test]
    fn test_invalid_samples_ignored_inside_run() {
        let mut machine = BlinkStateMachine::default();
        let seq = [Some(0.35), Some(0.10), Some(0.0), None, Some(0.15)];
        for (i, v) in seq.iter().enumerate() {
            machine.step(EarSample::new(i as f64, *v));
        }
        assert_eq!(machine.session().consecutive_closed_frames, 2);

        let out = machine.step(EarSample::new(5.0, Some(0.40)));
        assert!(!out.end);
        assert_eq!(out.total_blink_count, 0);
    }

    #[test]
    fn test_invalid_sample_output_passes_value_through() {
        let mut machine = BlinkStateMachine::default();
        let out = machine.step(EarSample::new(1.0, Some(-0.2)));
        assert_eq!(out.ear, Some(-0.2));
        assert!(!out.onset && !out.end);
        assert_eq!(machine.state(), BlinkState::Open);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let (machine, out) = run(&[0.30, 0.30]);
        assert!(out.iter().all(|o| !o.onset));
        assert_eq!(machine.state(), BlinkState::Open);
    }

    #[test]
    fn test_prolonged_closure_flagged_once_and_still_counted() {
        let mut values = vec![0.1; 30];
        values.push(0.4);
        let (machine, out) = run(&values);

        let flagged: Vec<usize> = out
            .iter()
            .enumerate()
            .filter(|(_, o)| o.prolonged)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(flagged, vec![DEFAULT_MAX_CONSECUTIVE_FRAMES as usize]);
        assert!(out[30].end);
        assert_eq!(machine.total_blink_count(), 1);
    }

    #[test]
    fn test_halt_stops_events() {
        let mut machine = BlinkStateMachine::default();
        machine.step(EarSample::new(0.0, Some(0.1)));
        machine.halt();
        for i in 1..10 {
            let out = machine.step(EarSample::new(i as f64, Some(0.1)));
            assert!(!out.onset && !out.end);
        }
        let out = machine.step(EarSample::new(10.0, Some(0.4)));
        assert!(!out.end);
        assert_eq!(machine.total_blink_count(), 0);

        machine.reset();
        assert!(!machine.is_halted());
        assert_eq!(machine.session(), &BlinkSession::default());
    }

    #[test]
    fn test_endless_closure_saturates_run_length() {
        let mut machine = BlinkStateMachine::default();
        machine.step(EarSample::new(0.0, Some(0.1)));
        machine.session.consecutive_closed_frames = u32::MAX - 1;

        for i in 1..4 {
            let out = machine.step(EarSample::new(i as f64, Some(0.1)));
            assert!(!out.end);
        }
        assert_eq!(machine.session().consecutive_closed_frames, u32::MAX);

        let out = machine.step(EarSample::new(4.0, Some(0.4)));
        assert!(out.end);
        assert_eq!(machine.total_blink_count(), 1);
    }

    #[test]
    fn test_events_iterator() {
        let (_, out) = run(&[0.1, 0.1, 0.1, 0.1, 0.4]);
        let onset: Vec<_> = out[0].events().collect();
        assert_eq!(onset.len(), 1);
        assert_eq!(onset[0].kind, BlinkEventKind::Onset);
        let end: Vec<_> = out[4].events().collect();
        assert_eq!(end[0].kind, BlinkEventKind::End);
        assert_eq!(out[2].events().count(), 0);
    }

    /// Reference count: maximal runs of valid sub-threshold samples with
    /// length >= min that are closed by a valid open sample.
    fn expected_counts(values: &[Option<f64>], cfg: &BlinkConfig) -> (u64, u64) {
        let mut blinks = 0;
        let mut onsets = 0;
        let mut run = 0u32;
        for v in values.iter().flatten().filter(|v| **v > 0.0) {
            if *v < cfg.threshold {
                if run == 0 {
                    onsets += 1;
                }
                run += 1;
            } else {
                if run >= cfg.min_consecutive_frames {
                    blinks += 1;
                }
                run = 0;
            }
        }
        (blinks, onsets)
    }

    fn ear_value() -> impl Strategy<Value = Option<f64>> {
        prop_oneof![
            1 => Just(None),
            1 => Just(Some(0.0)),
            1 => (-1.0_f64..0.0).prop_map(Some),
            6 => (0.01_f64..0.29).prop_map(Some),
            6 => (0.30_f64..0.6).prop_map(Some),
        ]
    }

    proptest! {
        #[test]
        fn pt_blink_count_matches_qualifying_runs(
            values in prop::collection::vec(ear_value(), 0..200)
        ) {
            let cfg = BlinkConfig::default();
            let mut machine = BlinkStateMachine::new(cfg);
            let mut onsets = 0u64;
            let mut ends = 0u64;
            for (i, v) in values.iter().enumerate() {
                let out = machine.step(EarSample::new(i as f64, *v));
                onsets += out.onset as u64;
                ends += out.end as u64;
                if out.end || (v.is_some_and(|v| v >= cfg.threshold)) {
                    prop_assert_eq!(machine.session().consecutive_closed_frames, 0);
                }
            }
            let (blinks, expected_onsets) = expected_counts(&values, &cfg);
            prop_assert_eq!(machine.total_blink_count(), blinks);
            prop_assert_eq!(ends, blinks);
            prop_assert_eq!(onsets, expected_onsets);
        }
    }
}
