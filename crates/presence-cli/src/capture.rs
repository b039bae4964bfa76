//! Capture loops for the two operating modes.
//!
//! A frame source is drained on a dedicated OS thread and forwarded over a
//! bounded channel; the async loop processes one frame at a time:
//! landmarks → liveness; once passed, embedding → enrollment or matching →
//! attendance ledger. Per-loop state (liveness session, last mark time)
//! lives in [`EnrollContext`] / [`AttendContext`].

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use presence_core::{
    minimum_samples, CosineMatcher, Embedding, EmbeddingError, EnrollmentAggregator,
    EnrollmentError, Identity, LivenessSession, LivenessVerdict, MatchResult, Matcher, Punch,
};
use presence_signals::{FrameSignals, SignalSource, SourceError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::cooldown::MarkCooldown;
use crate::store::{IdentityStore, StoreError};

/// Frames buffered between the reader thread and the capture loop.
const FRAME_QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("frame source error: {0}")]
    Source(#[from] SourceError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid input: {0}")]
    InvalidInput(#[from] EmbeddingError),
    #[error("enrollment failed: {0}")]
    Enrollment(#[from] EnrollmentError),
    #[error("no identities enrolled; run enroll first")]
    NoIdentities,
    #[error("failed to spawn source thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type FrameResult = Result<FrameSignals, SourceError>;

/// Drain `source` on its own thread.
///
/// The thread stops at end of source, after forwarding the first error, or
/// once the receiver is dropped.
pub fn spawn_source<S>(mut source: S) -> Result<mpsc::Receiver<FrameResult>, CaptureError>
where
    S: SignalSource + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<FrameResult>(FRAME_QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("presence-source".into())
        .spawn(move || {
            tracing::debug!("source thread started");
            loop {
                let item = match source.next_frame() {
                    Ok(Some(frame)) => Ok(frame),
                    Ok(None) => break,
                    Err(e) => Err(e),
                };
                let failed = item.is_err();
                if tx.blocking_send(item).is_err() || failed {
                    break;
                }
            }
            tracing::debug!("source thread exiting");
        })
        .map_err(CaptureError::Spawn)?;

    Ok(rx)
}

/// Local wall-clock time used for attendance days.
pub fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

// ── Enrollment ────────────────────────────────────────────────────────────────

/// State of one enrollment capture session.
pub struct EnrollContext {
    liveness: LivenessSession,
    aggregator: EnrollmentAggregator,
    target: usize,
    /// Instant that frame timestamp zero maps to.
    base: Instant,
}

impl EnrollContext {
    pub fn new(
        liveness: LivenessSession,
        aggregator: EnrollmentAggregator,
        target: usize,
        base: Instant,
    ) -> Self {
        Self {
            liveness,
            aggregator,
            target,
            base,
        }
    }

    pub fn samples(&self) -> usize {
        self.aggregator.len()
    }

    pub fn instruction(&self) -> String {
        self.liveness.instruction()
    }

    pub fn is_done(&self) -> bool {
        self.aggregator.len() >= self.target
    }

    /// Run liveness on the frame and, once passed, offer its embedding.
    pub fn process(&mut self, frame: &FrameSignals) -> Result<LivenessVerdict, EmbeddingError> {
        let now = self.base + frame.timestamp;
        let verdict = self.liveness.update(frame.landmarks.as_ref(), now);

        if verdict == LivenessVerdict::Timeout {
            tracing::warn!(challenge = %self.liveness.challenge(), "liveness timed out; new challenge");
            self.liveness.reset(now);
            return Ok(verdict);
        }

        if verdict.passed() {
            if let Some(embedding) = frame.embedding() {
                if self.aggregator.offer(embedding, now)? {
                    tracing::debug!(
                        samples = self.aggregator.len(),
                        target = self.target,
                        "enrollment sample accepted"
                    );
                }
            }
        }
        Ok(verdict)
    }

    /// Aggregate the collected samples, requiring `max(8, target / 2)`.
    pub fn finalize(&self) -> Result<Embedding, EnrollmentError> {
        self.aggregator.finalize(minimum_samples(self.target))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollSummary {
    pub name: String,
    pub frames: usize,
    pub samples: usize,
}

/// Collect samples until the target is reached, the source ends, or
/// `shutdown` resolves; then commit the template.
pub async fn run_enroll<F>(
    frames: &mut mpsc::Receiver<FrameResult>,
    store: &IdentityStore,
    name: &str,
    mut ctx: EnrollContext,
    shutdown: F,
) -> Result<EnrollSummary, CaptureError>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    tracing::info!(name, target = ctx.target, instruction = %ctx.instruction(), "enrollment started");

    let mut seen = 0usize;
    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::info!("enrollment stopped by user");
                break;
            }
            next = frames.recv() => match next {
                Some(frame) => frame?,
                None => break,
            },
        };
        seen += 1;

        let verdict = ctx.process(&frame)?;
        tracing::debug!(
            frame = frame.sequence,
            instruction = %ctx.instruction(),
            liveness = %verdict,
            samples = ctx.samples(),
            "enroll frame"
        );

        if ctx.is_done() {
            break;
        }
    }

    let template = ctx.finalize().map_err(|e| {
        tracing::warn!(name, error = %e, "not enough good samples collected");
        e
    })?;
    store.upsert_identity(name, &template).await?;
    tracing::info!(name, samples = ctx.samples(), "identity enrolled");

    Ok(EnrollSummary {
        name: name.to_string(),
        frames: seen,
        samples: ctx.samples(),
    })
}

// ── Attendance ────────────────────────────────────────────────────────────────

/// What the attendance loop should do after one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum AttendStep {
    /// Liveness not (yet) passed, or no face to match.
    Waiting(LivenessVerdict),
    /// Live face, nobody above threshold.
    NoMatch(MatchResult),
    /// Live, matched, but a mark happened too recently.
    CoolingDown { result: MatchResult, remaining: Duration },
    /// Live and matched: record attendance for this identity.
    Mark(MatchResult),
}

impl fmt::Display for AttendStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttendStep::Waiting(verdict) => write!(f, "Liveness: {verdict}"),
            AttendStep::NoMatch(r) => write!(f, "No match (sim={:.2})", r.similarity),
            AttendStep::CoolingDown { result, .. } | AttendStep::Mark(result) => write!(
                f,
                "Match: {} (sim={:.2})",
                result.identity.as_deref().unwrap_or("?"),
                result.similarity
            ),
        }
    }
}

/// State of one attendance capture loop.
pub struct AttendContext {
    liveness: LivenessSession,
    cooldown: MarkCooldown,
    threshold: f32,
    base: Instant,
}

impl AttendContext {
    pub fn new(liveness: LivenessSession, cooldown: MarkCooldown, threshold: f32, base: Instant) -> Self {
        Self {
            liveness,
            cooldown,
            threshold,
            base,
        }
    }

    pub fn instruction(&self) -> String {
        self.liveness.instruction()
    }

    pub fn process(
        &mut self,
        frame: &FrameSignals,
        gallery: &[Identity],
    ) -> Result<AttendStep, EmbeddingError> {
        let now = self.base + frame.timestamp;
        let verdict = self.liveness.update(frame.landmarks.as_ref(), now);

        if verdict == LivenessVerdict::Timeout {
            tracing::warn!(challenge = %self.liveness.challenge(), "liveness timed out; new challenge");
            self.liveness.reset(now);
            return Ok(AttendStep::Waiting(verdict));
        }
        if !verdict.passed() {
            return Ok(AttendStep::Waiting(verdict));
        }
        let Some(probe) = frame.embedding() else {
            return Ok(AttendStep::Waiting(verdict));
        };

        let result = CosineMatcher.compare(probe, gallery, self.threshold)?;
        if !result.matched {
            return Ok(AttendStep::NoMatch(result));
        }

        Ok(match self.cooldown.check(now) {
            Ok(()) => AttendStep::Mark(result),
            Err(remaining) => AttendStep::CoolingDown { result, remaining },
        })
    }

    /// A mark was committed for the frame at `timestamp`: start the cooldown
    /// and require a fresh liveness pass for the next one.
    pub fn marked(&mut self, timestamp: Duration) {
        let now = self.base + timestamp;
        self.cooldown.record(now);
        self.liveness.reset(now);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendSummary {
    pub frames: usize,
    pub punches: Vec<Punch>,
    /// Recognitions dropped by the mark cooldown.
    pub suppressed: usize,
}

/// Match live faces against the enrolled gallery and mark attendance until
/// the source ends or `shutdown` resolves.
pub async fn run_attend<F>(
    frames: &mut mpsc::Receiver<FrameResult>,
    store: &IdentityStore,
    mut ctx: AttendContext,
    shutdown: F,
) -> Result<AttendSummary, CaptureError>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    let gallery = store.load_gallery().await?;
    if gallery.is_empty() {
        return Err(CaptureError::NoIdentities);
    }
    tracing::info!(
        identities = gallery.len(),
        threshold = ctx.threshold,
        instruction = %ctx.instruction(),
        "attendance started"
    );

    let mut summary = AttendSummary {
        frames: 0,
        punches: Vec::new(),
        suppressed: 0,
    };

    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::info!("attendance stopped by user");
                break;
            }
            next = frames.recv() => match next {
                Some(frame) => frame?,
                None => break,
            },
        };
        summary.frames += 1;

        let step = ctx.process(&frame, &gallery)?;
        tracing::debug!(frame = frame.sequence, instruction = %ctx.instruction(), status = %step, "attend frame");

        match step {
            AttendStep::Mark(result) => {
                let Some(name) = result.identity else {
                    continue;
                };
                let punch = store.mark_attendance(&name, local_now()).await?;
                ctx.marked(frame.timestamp);
                println!(
                    "{}: {} @ {} (sim={:.2})",
                    punch.identity,
                    punch.event,
                    punch.at.format("%Y-%m-%d %H:%M:%S"),
                    result.similarity
                );
                summary.punches.push(punch);
            }
            AttendStep::CoolingDown { remaining, .. } => {
                tracing::trace!(remaining_ms = remaining.as_millis() as u64, "mark suppressed by cooldown");
                summary.suppressed += 1;
            }
            AttendStep::Waiting(_) | AttendStep::NoMatch(_) => {}
        }
    }

    Ok(summary)
}
