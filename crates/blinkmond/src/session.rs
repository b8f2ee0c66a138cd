use crate::config::Config;
use crate::pipeline::{FramePipeline, PipelineStats};
use crate::transport::{FrameTransport, TransportError, TransportEvent, TransportState};
use blinkmon_core::{BlinkState, LandmarkProvider, SeriesSnapshot};
use blinkmon_hw::{Camera, CameraError, FrameEncoder, FrameSource};
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("camera error: {0}")]
    Device(#[from] CameraError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("a session is already active")]
    AlreadyActive,
    #[error("no active session")]
    NotActive,
    #[error("session thread exited")]
    ChannelClosed,
    #[error("failed to spawn session thread: {0}")]
    Spawn(std::io::Error),
}

/// Camera and transport held for the lifetime of one session.
///
/// Released together: the source first, then the transport. Dropping the
/// value releases whatever is still held.
pub struct SessionResources<S> {
    source: Option<S>,
    transport: Option<FrameTransport>,
}

impl<S: FrameSource> SessionResources<S> {
    pub fn new(source: S, transport: FrameTransport) -> Self {
        Self {
            source: Some(source),
            transport: Some(transport),
        }
    }

    fn parts(&mut self) -> Option<(&mut S, &mut FrameTransport)> {
        match (self.source.as_mut(), self.transport.as_mut()) {
            (Some(source), Some(transport)) => Some((source, transport)),
            _ => None,
        }
    }
}

impl<S> SessionResources<S> {
    pub fn release(&mut self) {
        if let Some(source) = self.source.take() {
            drop(source);
            tracing::info!("frame source released");
        }
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
    }
}

impl<S> Drop for SessionResources<S> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    /// `None` while idle.
    pub session_id: Option<Uuid>,
    pub blink_state: BlinkState,
    pub total_blink_count: u64,
    pub stats: PipelineStats,
    pub transport: Option<TransportState>,
    pub series: SeriesSnapshot,
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub total_blink_count: u64,
    pub stats: PipelineStats,
    /// Set when the session ended on its own rather than by `stop()`.
    pub error: Option<SessionError>,
}

enum SessionRequest {
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    /// Sent only by `SessionController::clear`, which the daemon does not call yet.
    #[allow(dead_code)]
    Clear { reply: oneshot::Sender<()> },
    Stop,
}

/// Handed back by the session thread on exit.
struct SessionReport<P, E> {
    pipeline: FramePipeline<P, E>,
    summary: SessionSummary,
}

struct ActiveSession<P, E> {
    id: Uuid,
    requests: mpsc::UnboundedSender<SessionRequest>,
    done: oneshot::Receiver<SessionReport<P, E>>,
}

/// Owns the pipeline (and with it the state machine and buffer) and runs at
/// most one session at a time.
pub struct SessionController<P, E> {
    config: Config,
    idle: Option<FramePipeline<P, E>>,
    active: Option<ActiveSession<P, E>>,
}

impl<P, E> SessionController<P, E>
where
    P: LandmarkProvider + Send + 'static,
    E: FrameEncoder + Send + 'static,
{
    pub fn new(config: Config, pipeline: FramePipeline<P, E>) -> Self {
        Self {
            config,
            idle: Some(pipeline),
            active: None,
        }
    }

    /// Open the configured camera, connect the transport and start capturing.
    ///
    /// Either both resources are acquired or neither is held on return.
    pub async fn start(&mut self) -> Result<Uuid, SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyActive);
        }

        let device = self.config.camera_device.clone();
        let (width, height, warmup) = (
            self.config.capture_width,
            self.config.capture_height,
            self.config.warmup_frames,
        );
        let camera = tokio::task::spawn_blocking(move || -> Result<Camera, CameraError> {
            let mut camera = Camera::open(&device, width, height)?;
            camera.warm_up(warmup)?;
            Ok(camera)
        })
        .await
        .map_err(|_| SessionError::ChannelClosed)??;

        let transport = match FrameTransport::connect(
            &self.config.endpoint_url,
            self.config.connect_timeout(),
            self.config.outbox_capacity,
        )
        .await
        {
            Ok(transport) => transport,
            Err(e) => {
                camera.release();
                return Err(e.into());
            }
        };

        self.start_with(camera, transport)
    }

    /// Start a session on already-acquired resources.
    pub fn start_with<S>(
        &mut self,
        source: S,
        transport: FrameTransport,
    ) -> Result<Uuid, SessionError>
    where
        S: FrameSource + Send + 'static,
    {
        if self.active.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        let resources = SessionResources::new(source, transport);
        let mut pipeline = self.idle.take().ok_or(SessionError::ChannelClosed)?;
        pipeline.begin_session();

        let id = Uuid::new_v4();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        // A failed spawn drops the pipeline with the closure; the controller
        // cannot start again after that.
        std::thread::Builder::new()
            .name("blinkmon-session".into())
            .spawn(move || {
                tracing::info!(session = %id, "session thread started");
                let report = run_session(id, resources, pipeline, req_rx);
                let _ = done_tx.send(report);
            })
            .map_err(SessionError::Spawn)?;

        self.active = Some(ActiveSession {
            id,
            requests: req_tx,
            done: done_rx,
        });
        Ok(id)
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        match (&self.active, &self.idle) {
            (Some(active), _) => {
                let (reply, rx) = oneshot::channel();
                active
                    .requests
                    .send(SessionRequest::Status { reply })
                    .map_err(|_| SessionError::ChannelClosed)?;
                rx.await.map_err(|_| SessionError::ChannelClosed)
            }
            (None, Some(pipeline)) => Ok(status_of(None, pipeline, None)),
            (None, None) => Err(SessionError::ChannelClosed),
        }
    }

    /// Empty the series buffer. The only operation that discards points.
    // No daemon trigger until the endpoint grows a clear command.
    #[allow(dead_code)]
    pub async fn clear(&mut self) -> Result<(), SessionError> {
        if let Some(active) = &self.active {
            let (reply, rx) = oneshot::channel();
            active
                .requests
                .send(SessionRequest::Clear { reply })
                .map_err(|_| SessionError::ChannelClosed)?;
            return rx.await.map_err(|_| SessionError::ChannelClosed);
        }
        let pipeline = self.idle.as_mut().ok_or(SessionError::ChannelClosed)?;
        pipeline.buffer_mut().clear();
        Ok(())
    }

    /// Stop the active session and wait for its resources to be released.
    pub async fn stop(&mut self) -> Result<SessionSummary, SessionError> {
        let active = self.active.as_ref().ok_or(SessionError::NotActive)?;
        tracing::info!(session = %active.id, "stopping session");
        // A session that already ended has dropped its receiver.
        let _ = active.requests.send(SessionRequest::Stop);
        self.finished().await
    }

    /// Wait for the active session to end, by `stop()` or on its own.
    pub async fn finished(&mut self) -> Result<SessionSummary, SessionError> {
        let active = self.active.as_mut().ok_or(SessionError::NotActive)?;
        let report = (&mut active.done).await;
        self.active = None;
        let report = report.map_err(|_| SessionError::ChannelClosed)?;
        self.idle = Some(report.pipeline);
        Ok(report.summary)
    }
}

fn status_of<P: LandmarkProvider, E: FrameEncoder>(
    id: Option<Uuid>,
    pipeline: &FramePipeline<P, E>,
    transport: Option<TransportState>,
) -> SessionStatus {
    SessionStatus {
        session_id: id,
        blink_state: pipeline.machine().state(),
        total_blink_count: pipeline.machine().total_blink_count(),
        stats: *pipeline.stats(),
        transport,
        series: pipeline.buffer().snapshot(),
    }
}

/// Why the acquisition loop stopped.
enum LoopExit {
    Requested,
    Failed(SessionError),
}

fn run_session<S, P, E>(
    id: Uuid,
    mut resources: SessionResources<S>,
    mut pipeline: FramePipeline<P, E>,
    mut requests: mpsc::UnboundedReceiver<SessionRequest>,
) -> SessionReport<P, E>
where
    S: FrameSource,
    P: LandmarkProvider,
    E: FrameEncoder,
{
    let started_at = Utc::now();
    let started = Instant::now();

    let exit = match resources.parts() {
        Some((source, transport)) => {
            acquisition_loop(id, source, transport, &mut pipeline, &mut requests)
        }
        None => LoopExit::Failed(SessionError::NotActive),
    };

    pipeline.halt();
    resources.release();
    pipeline.buffer_mut().stop();

    let error = match exit {
        LoopExit::Requested => None,
        LoopExit::Failed(e) => {
            tracing::warn!(session = %id, error = %e, "session ended");
            Some(e)
        }
    };
    let summary = SessionSummary {
        session_id: id,
        started_at,
        duration: started.elapsed(),
        total_blink_count: pipeline.machine().total_blink_count(),
        stats: *pipeline.stats(),
        error,
    };
    tracing::info!(
        session = %id,
        blinks = summary.total_blink_count,
        frames = summary.stats.frames_processed,
        duration_secs = summary.duration.as_secs_f64(),
        "session finished"
    );

    SessionReport { pipeline, summary }
}

fn acquisition_loop<S, P, E>(
    id: Uuid,
    source: &mut S,
    transport: &mut FrameTransport,
    pipeline: &mut FramePipeline<P, E>,
    requests: &mut mpsc::UnboundedReceiver<SessionRequest>,
) -> LoopExit
where
    S: FrameSource,
    P: LandmarkProvider,
    E: FrameEncoder,
{
    let outbox = transport.outbox().clone();
    loop {
        loop {
            match requests.try_recv() {
                Ok(SessionRequest::Status { reply }) => {
                    let _ = reply.send(status_of(Some(id), pipeline, Some(transport.state())));
                }
                Ok(SessionRequest::Clear { reply }) => {
                    pipeline.buffer_mut().clear();
                    let _ = reply.send(());
                }
                Ok(SessionRequest::Stop) | Err(TryRecvError::Disconnected) => {
                    return LoopExit::Requested;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        while let Some(event) = transport.try_next_event() {
            match event {
                TransportEvent::Message(msg) => pipeline.record_inbound(&msg),
                TransportEvent::Closed(Ok(())) => return LoopExit::Requested,
                TransportEvent::Closed(Err(e)) => return LoopExit::Failed(e.into()),
            }
        }

        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "capture failed");
                return LoopExit::Failed(e.into());
            }
        };
        pipeline.process(frame, &outbox);
    }
}
