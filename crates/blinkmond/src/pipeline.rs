//! Per-frame processing: landmarks → EAR → blink state → wire → series.
//!
//! Each frame is handled to completion before the next one is taken. A
//! failing stage only empties its own output; the frame still flows through
//! the remaining stages and is released when `process` returns.

use crate::transport::{InboundMessage, MetricsRecord, Outbox, SendOutcome, TransportState};
use blinkmon_core::{
    BlinkConfig, BlinkStateMachine, DetectionError, EarExtractor, EarSample, LandmarkProvider,
    LiveSeriesBuffer, StepOutput,
};
use blinkmon_hw::{Frame, FrameEncoder};
use serde::Serialize;

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub null_samples: u64,
    pub provider_unavailable: u64,
    pub detection_errors: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub metrics_sent: u64,
    pub metrics_dropped: u64,
    pub encode_failures: u64,
    pub inbound_frames: u64,
    pub inbound_texts: u64,
}

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    pub step: StepOutput,
    pub metrics: SendOutcome,
    /// `None` if encoding failed.
    pub frame: Option<SendOutcome>,
    pub appended: bool,
}

pub struct FramePipeline<P, E> {
    provider: P,
    encoder: E,
    extractor: EarExtractor,
    machine: BlinkStateMachine,
    buffer: LiveSeriesBuffer,
    stats: PipelineStats,
}

impl<P: LandmarkProvider, E: FrameEncoder> FramePipeline<P, E> {
    pub fn new(provider: P, encoder: E, blink: BlinkConfig, buffer: LiveSeriesBuffer) -> Self {
        Self {
            provider,
            encoder,
            extractor: EarExtractor::default(),
            machine: BlinkStateMachine::new(blink),
            buffer,
            stats: PipelineStats::default(),
        }
    }

    /// Fresh blink counters and stats; the buffer starts accepting points.
    pub fn begin_session(&mut self) {
        self.machine.reset();
        self.stats = PipelineStats::default();
        self.buffer.start();
    }

    /// Stop emitting blink events. Buffer contents are untouched.
    pub fn halt(&mut self) {
        self.machine.halt();
    }

    pub fn machine(&self) -> &BlinkStateMachine {
        &self.machine
    }

    pub fn buffer(&self) -> &LiveSeriesBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut LiveSeriesBuffer {
        &mut self.buffer
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Run one frame through every stage. The frame is released on return.
    pub fn process(&mut self, frame: Frame, outbox: &Outbox) -> FrameReport {
        let timestamp = frame.epoch_seconds();
        self.stats.frames_processed += 1;

        let landmarks = match self.provider.detect(&frame.data, frame.width, frame.height) {
            Ok(landmarks) => landmarks,
            Err(DetectionError::Unavailable) => {
                self.stats.provider_unavailable += 1;
                None
            }
            Err(e) => {
                self.stats.detection_errors += 1;
                tracing::warn!(sequence = frame.sequence, error = %e, "landmark detection failed");
                None
            }
        };

        let ear = self
            .extractor
            .extract(landmarks.as_ref(), frame.width, frame.height);
        let step = self.machine.step(EarSample::new(timestamp, ear));
        if step.ear.is_none() {
            self.stats.null_samples += 1;
        }
        if step.end {
            tracing::info!(
                timestamp,
                total = step.total_blink_count,
                duration = ?step.closure_duration,
                "blink"
            );
        }

        let metrics = outbox.send_metrics(MetricsRecord {
            timestamp,
            ear_value: step.ear,
            event_onset: step.onset,
            event_end: step.end,
        });
        if metrics.is_queued() {
            self.stats.metrics_sent += 1;
        } else {
            self.stats.metrics_dropped += 1;
        }

        let frame_outcome = self.send_frame(&frame, outbox);
        match frame_outcome {
            Some(SendOutcome::Queued) => self.stats.frames_sent += 1,
            Some(outcome) => {
                self.stats.frames_dropped += 1;
                tracing::trace!(sequence = frame.sequence, ?outcome, "frame payload dropped");
            }
            None => {}
        }

        let appended = self.buffer.append(timestamp, step.ear);

        frame.release();
        FrameReport {
            step,
            metrics,
            frame: frame_outcome,
            appended,
        }
    }

    /// Encoding is skipped when the payload would be dropped anyway.
    fn send_frame(&mut self, frame: &Frame, outbox: &Outbox) -> Option<SendOutcome> {
        if !outbox.frame_slot_free() {
            return Some(match outbox.state() {
                TransportState::Open => SendOutcome::DroppedPending,
                _ => SendOutcome::DroppedNotOpen,
            });
        }
        match self.encoder.encode(frame) {
            Ok(bytes) => Some(outbox.send_frame(bytes)),
            Err(e) => {
                self.stats.encode_failures += 1;
                tracing::warn!(sequence = frame.sequence, error = %e, "frame encoding failed");
                None
            }
        }
    }

    pub fn record_inbound(&mut self, msg: &InboundMessage) {
        match msg {
            InboundMessage::AnnotatedFrame(bytes) => {
                self.stats.inbound_frames += 1;
                tracing::trace!(bytes = bytes.len(), "annotated frame received");
            }
            InboundMessage::Text(value) => {
                self.stats.inbound_texts += 1;
                tracing::debug!(message = %value, "endpoint message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{counted_frame, FakeEncoder, Scripted, ScriptedProvider};
    use blinkmon_core::ValueRange;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn pipeline(
        script: Vec<Scripted>,
        fail_encode: bool,
    ) -> FramePipeline<ScriptedProvider, FakeEncoder> {
        let mut p = FramePipeline::new(
            ScriptedProvider::new(script),
            FakeEncoder { fail: fail_encode },
            BlinkConfig::default(),
            LiveSeriesBuffer::new(10, ValueRange::default()),
        );
        p.begin_session();
        p
    }

    fn open_outbox() -> (Outbox, tokio::sync::mpsc::Receiver<crate::transport::OutboundMessage>) {
        let (outbox, rx) = Outbox::channel(16);
        outbox.force_state(TransportState::Open);
        (outbox, rx)
    }

    #[test]
    fn test_pending_frame_dropped_but_detection_continues() {
        let released = Arc::new(AtomicUsize::new(0));
        let (outbox, _rx) = open_outbox();
        let mut p = pipeline(vec![Scripted::Ear(0.35), Scripted::Ear(0.20)], false);

        let first = p.process(counted_frame(0, &released), &outbox);
        assert_eq!(first.frame, Some(SendOutcome::Queued));

        // Writer has not flushed the first frame yet.
        let second = p.process(counted_frame(1, &released), &outbox);
        assert_eq!(second.frame, Some(SendOutcome::DroppedPending));
        assert_eq!(second.metrics, SendOutcome::Queued);
        assert!(second.step.onset);
        assert!(second.appended);
        assert_eq!(p.buffer().len(), 2);

        assert_eq!(p.stats().frames_sent, 1);
        assert_eq!(p.stats().frames_dropped, 1);
        assert_eq!(p.stats().metrics_sent, 2);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_frame_accepted_after_flush() {
        let released = Arc::new(AtomicUsize::new(0));
        let (outbox, _rx) = open_outbox();
        let mut p = pipeline(vec![], false);

        p.process(counted_frame(0, &released), &outbox);
        outbox.mark_flushed();
        let report = p.process(counted_frame(1, &released), &outbox);
        assert_eq!(report.frame, Some(SendOutcome::Queued));
        assert_eq!(p.stats().frames_sent, 2);
    }

    #[test]
    fn test_closed_transport_still_detects() {
        let released = Arc::new(AtomicUsize::new(0));
        let (outbox, _rx) = Outbox::channel(4);
        outbox.force_state(TransportState::Closed);
        let script = vec![
            Scripted::Ear(0.35),
            Scripted::Ear(0.20),
            Scripted::Ear(0.18),
            Scripted::Ear(0.15),
            Scripted::Ear(0.10),
            Scripted::Ear(0.40),
        ];
        let mut p = pipeline(script, false);

        let reports: Vec<_> = (0..6)
            .map(|seq| p.process(counted_frame(seq, &released), &outbox))
            .collect();

        assert!(reports[1].step.onset);
        assert!(reports[5].step.end);
        assert_eq!(p.machine().total_blink_count(), 1);
        let dropped = SendOutcome::DroppedNotOpen;
        assert!(reports
            .iter()
            .all(|r| r.frame == Some(dropped) && r.metrics == dropped));
        assert_eq!(p.buffer().len(), 6);
        assert_eq!(released.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_null_samples_not_appended() {
        let released = Arc::new(AtomicUsize::new(0));
        let (outbox, _rx) = open_outbox();
        let mut p = pipeline(
            vec![Scripted::NoFace, Scripted::Unavailable, Scripted::Ear(0.33)],
            false,
        );

        let reports: Vec<_> = (0..3)
            .map(|seq| p.process(counted_frame(seq, &released), &outbox))
            .collect();

        assert!(!reports[0].appended);
        assert!(!reports[1].appended);
        assert!(reports[2].appended);
        assert_eq!(p.stats().null_samples, 2);
        assert_eq!(p.stats().provider_unavailable, 1);
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_encode_failure_isolated() {
        let released = Arc::new(AtomicUsize::new(0));
        let (outbox, _rx) = open_outbox();
        let mut p = pipeline(vec![Scripted::Ear(0.31)], true);

        let report = p.process(counted_frame(0, &released), &outbox);
        assert_eq!(report.frame, None);
        assert_eq!(report.metrics, SendOutcome::Queued);
        assert!(report.appended);
        assert_eq!(p.stats().encode_failures, 1);
        assert!(outbox.frame_slot_free());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_halted_machine_keeps_buffer() {
        let released = Arc::new(AtomicUsize::new(0));
        let (outbox, _rx) = open_outbox();
        let mut p = pipeline(vec![Scripted::Ear(0.35), Scripted::Ear(0.10)], false);

        p.process(counted_frame(0, &released), &outbox);
        p.halt();
        p.buffer_mut().stop();
        let report = p.process(counted_frame(1, &released), &outbox);
        assert!(!report.step.onset);
        assert!(!report.appended);
        assert_eq!(p.buffer().len(), 1);
    }

    #[test]
    fn test_inbound_counted() {
        let mut p = pipeline(vec![], false);
        p.record_inbound(&InboundMessage::AnnotatedFrame(vec![1, 2]));
        let ack = serde_json::json!({"status": "received"});
        p.record_inbound(&InboundMessage::Text(ack));
        assert_eq!(p.stats().inbound_frames, 1);
        assert_eq!(p.stats().inbound_texts, 1);
    }
}
