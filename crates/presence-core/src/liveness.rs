//! Active liveness detection via a randomized challenge.
//!
//! Each session draws one challenge (blink, turn left, turn right) and then
//! watches per-frame landmark features until the subject performs it or the
//! session times out. A printed photo cannot blink on request and a replayed
//! clip is unlikely to turn the requested way inside the window.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs, static images, replays that do not
//!   happen to perform the drawn challenge.
//! - **Does not block:** Interactive puppeteering, 3D masks, or a replay that
//!   guesses the challenge. A single blink is weak evidence on its own; raise
//!   [`LivenessConfig::required_blinks`] for stricter deployments.

use std::fmt;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::landmarks::LandmarkSet;

/// Challenge the subject has to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Challenge {
    Blink,
    TurnLeft,
    TurnRight,
}

impl Challenge {
    pub const ALL: [Challenge; 3] = [Challenge::Blink, Challenge::TurnLeft, Challenge::TurnRight];

    /// Draw a challenge uniformly at random.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::ALL[rng.gen_range(0..Self::ALL.len())]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Challenge::Blink => "BLINK",
            Challenge::TurnLeft => "TURN_LEFT",
            Challenge::TurnRight => "TURN_RIGHT",
        }
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds for the challenge evaluation.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// How long a challenge stays answerable after `reset`.
    pub timeout: Duration,
    /// EAR below which an open eye is considered closed.
    pub ear_close: f32,
    /// EAR above which a closed eye is considered open again (counts a blink).
    pub ear_open: f32,
    /// Yaw magnitude a turn challenge must exceed.
    pub yaw_threshold: f32,
    /// Completed blinks needed to pass a blink challenge.
    pub required_blinks: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            ear_close: 0.19,
            ear_open: 0.23,
            yaw_threshold: 0.03,
            required_blinks: 1,
        }
    }
}

/// Progress of an unfinished challenge, reported back for display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    Blinks(u32),
    Yaw(f32),
}

/// Outcome of one [`LivenessSession::update`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LivenessVerdict {
    /// The session passed on an earlier frame.
    AlreadyPassed,
    /// The challenge was satisfied on this frame.
    Passed,
    /// The challenge window elapsed without a pass.
    Timeout,
    /// No landmarks this frame.
    NoFaceMesh,
    /// Face visible but the challenge is not met yet.
    Pending(Progress),
}

impl LivenessVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, LivenessVerdict::AlreadyPassed | LivenessVerdict::Passed)
    }

    /// Status string for the UI loop.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for LivenessVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LivenessVerdict::AlreadyPassed => f.write_str("OK"),
            LivenessVerdict::Passed => f.write_str("LIVENESS_OK"),
            LivenessVerdict::Timeout => f.write_str("LIVENESS_TIMEOUT"),
            LivenessVerdict::NoFaceMesh => f.write_str("NO_FACE_MESH"),
            LivenessVerdict::Pending(Progress::Blinks(n)) => write!(f, "BLINKS={n}"),
            LivenessVerdict::Pending(Progress::Yaw(y)) => write!(f, "YAW={y:.3}"),
        }
    }
}

/// One challenge-response liveness session.
///
/// Owned by a single capture loop. A passed session stays passed until
/// [`reset`](Self::reset) is called.
#[derive(Debug, Clone)]
pub struct LivenessSession {
    config: LivenessConfig,
    challenge: Challenge,
    started_at: Instant,
    blink_count: u32,
    eye_closed: bool,
    completed: bool,
}

impl LivenessSession {
    /// Start a session with a randomly drawn challenge.
    pub fn new(config: LivenessConfig, now: Instant) -> Self {
        let challenge = Challenge::random(&mut rand::thread_rng());
        Self::with_challenge(challenge, config, now)
    }

    /// Start a session with a fixed challenge.
    pub fn with_challenge(challenge: Challenge, config: LivenessConfig, now: Instant) -> Self {
        Self {
            config,
            challenge,
            started_at: now,
            blink_count: 0,
            eye_closed: false,
            completed: false,
        }
    }

    /// Draw a fresh challenge and restart the clock.
    pub fn reset(&mut self, now: Instant) {
        self.reset_with(&mut rand::thread_rng(), now);
    }

    pub fn reset_with<R: Rng + ?Sized>(&mut self, rng: &mut R, now: Instant) {
        self.challenge = Challenge::random(rng);
        self.started_at = now;
        self.blink_count = 0;
        self.eye_closed = false;
        self.completed = false;
        tracing::debug!(challenge = %self.challenge, "liveness challenge drawn");
    }

    pub fn challenge(&self) -> Challenge {
        self.challenge
    }

    pub fn blink_count(&self) -> u32 {
        self.blink_count
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn instruction(&self) -> String {
        format!("Liveness: {}", self.challenge)
    }

    /// Whether the challenge window has closed at `now`.
    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started_at) >= self.config.timeout
    }

    /// Feed one frame's landmarks (if any) taken at `now`.
    pub fn update(&mut self, landmarks: Option<&LandmarkSet>, now: Instant) -> LivenessVerdict {
        if self.completed {
            return LivenessVerdict::AlreadyPassed;
        }

        if self.is_timed_out(now) {
            return LivenessVerdict::Timeout;
        }

        let Some(landmarks) = landmarks else {
            return LivenessVerdict::NoFaceMesh;
        };

        let progress = match self.challenge {
            Challenge::Blink => self.observe_blink(landmarks.mean_eye_aspect_ratio()),
            Challenge::TurnLeft | Challenge::TurnRight => {
                let yaw = landmarks.approx_yaw();
                if self.turn_satisfied(yaw) {
                    None
                } else {
                    Some(Progress::Yaw(yaw))
                }
            }
        };

        match progress {
            None => {
                self.completed = true;
                tracing::info!(
                    challenge = %self.challenge,
                    elapsed_ms = now.saturating_duration_since(self.started_at).as_millis() as u64,
                    "liveness challenge passed"
                );
                LivenessVerdict::Passed
            }
            Some(p) => LivenessVerdict::Pending(p),
        }
    }

    /// Hysteresis blink counter. `None` once enough blinks are seen.
    fn observe_blink(&mut self, ear: f32) -> Option<Progress> {
        if ear < self.config.ear_close && !self.eye_closed {
            self.eye_closed = true;
        }
        if ear > self.config.ear_open && self.eye_closed {
            self.eye_closed = false;
            self.blink_count += 1;
            tracing::trace!(ear, blinks = self.blink_count, "blink counted");
        }

        if self.blink_count >= self.config.required_blinks {
            None
        } else {
            Some(Progress::Blinks(self.blink_count))
        }
    }

    fn turn_satisfied(&self, yaw: f32) -> bool {
        match self.challenge {
            Challenge::TurnLeft => yaw > self.config.yaw_threshold,
            Challenge::TurnRight => yaw < -self.config.yaw_threshold,
            Challenge::Blink => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::fixtures::face;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn session(challenge: Challenge) -> (LivenessSession, Instant) {
        let t0 = Instant::now();
        (
            LivenessSession::with_challenge(challenge, LivenessConfig::default(), t0),
            t0,
        )
    }

    fn at(t0: Instant, ms: u64) -> Instant {
        t0 + Duration::from_millis(ms)
    }

    #[test]
    fn test_blink_open_closed_open_passes() {
        let (mut s, t0) = session(Challenge::Blink);
        assert_eq!(
            s.update(Some(&face(0.30, 0.0)), at(t0, 0)),
            LivenessVerdict::Pending(Progress::Blinks(0))
        );
        assert!(!s.update(Some(&face(0.15, 0.0)), at(t0, 33)).passed());
        let v = s.update(Some(&face(0.30, 0.0)), at(t0, 66));
        assert_eq!(v, LivenessVerdict::Passed);
        assert_eq!(v.reason(), "LIVENESS_OK");
        assert_eq!(s.blink_count(), 1);
    }

    #[test]
    fn test_eyes_always_open_never_passes() {
        let (mut s, t0) = session(Challenge::Blink);
        for i in 0..3 {
            let v = s.update(Some(&face(0.30, 0.0)), at(t0, i * 33));
            assert!(!v.passed());
            assert_eq!(v.reason(), "BLINKS=0");
        }
    }

    #[test]
    fn test_blink_hysteresis_ignores_noise_in_band() {
        // Dipping into the 0.19..0.23 band never closes the eye.
        let (mut s, t0) = session(Challenge::Blink);
        for (i, ear) in [0.30, 0.21, 0.25, 0.20, 0.30].iter().enumerate() {
            assert!(!s.update(Some(&face(*ear, 0.0)), at(t0, i as u64 * 33)).passed());
        }
        assert_eq!(s.blink_count(), 0);

        // Closed then hovering in the band does not count until it clears 0.23.
        assert!(!s.update(Some(&face(0.15, 0.0)), at(t0, 200)).passed());
        assert!(!s.update(Some(&face(0.21, 0.0)), at(t0, 233)).passed());
        assert_eq!(s.blink_count(), 0);
        assert!(s.update(Some(&face(0.26, 0.0)), at(t0, 266)).passed());
    }

    #[test]
    fn test_required_blinks_configurable() {
        let t0 = Instant::now();
        let config = LivenessConfig {
            required_blinks: 2,
            ..LivenessConfig::default()
        };
        let mut s = LivenessSession::with_challenge(Challenge::Blink, config, t0);
        let seq = [0.30, 0.10, 0.30, 0.10];
        for (i, ear) in seq.iter().enumerate() {
            assert!(!s.update(Some(&face(*ear, 0.0)), at(t0, i as u64 * 40)).passed());
        }
        assert_eq!(
            s.update(Some(&face(0.30, 0.0)), at(t0, 200)),
            LivenessVerdict::Passed
        );
        assert_eq!(s.blink_count(), 2);
    }

    #[test]
    fn test_turn_left_requires_positive_yaw() {
        let (mut s, t0) = session(Challenge::TurnLeft);
        let v = s.update(Some(&face(0.3, -0.05)), at(t0, 0));
        assert_eq!(v.reason(), "YAW=-0.050");
        assert!(!s.update(Some(&face(0.3, 0.02)), at(t0, 30)).passed());
        assert_eq!(
            s.update(Some(&face(0.3, 0.05)), at(t0, 60)),
            LivenessVerdict::Passed
        );
    }

    #[test]
    fn test_turn_right_requires_negative_yaw() {
        let (mut s, t0) = session(Challenge::TurnRight);
        assert!(!s.update(Some(&face(0.3, 0.05)), at(t0, 0)).passed());
        assert!(!s.update(Some(&face(0.3, -0.02)), at(t0, 30)).passed());
        assert!(s.update(Some(&face(0.3, -0.05)), at(t0, 60)).passed());
    }

    #[test]
    fn test_completed_is_sticky_until_reset() {
        let (mut s, t0) = session(Challenge::TurnLeft);
        assert!(s.update(Some(&face(0.3, 0.05)), at(t0, 0)).passed());

        // Any input, even past the timeout, keeps reporting OK.
        assert_eq!(s.update(None, at(t0, 100)), LivenessVerdict::AlreadyPassed);
        assert_eq!(
            s.update(Some(&face(0.3, -0.2)), at(t0, 20_000)),
            LivenessVerdict::AlreadyPassed
        );
        assert_eq!(LivenessVerdict::AlreadyPassed.reason(), "OK");

        s.reset(at(t0, 20_000));
        assert!(!s.is_completed());
        assert!(!s.update(None, at(t0, 20_010)).passed());
    }

    #[test]
    fn test_no_landmarks_is_soft_failure() {
        let (mut s, t0) = session(Challenge::Blink);
        let v = s.update(None, at(t0, 10));
        assert_eq!(v, LivenessVerdict::NoFaceMesh);
        assert_eq!(v.reason(), "NO_FACE_MESH");
    }

    #[test]
    fn test_timeout_at_deadline_not_before() {
        let (mut s, t0) = session(Challenge::Blink);
        for ms in [0, 1_000, 4_000, 7_999] {
            assert_ne!(
                s.update(Some(&face(0.30, 0.0)), at(t0, ms)),
                LivenessVerdict::Timeout
            );
        }
        assert_eq!(
            s.update(Some(&face(0.30, 0.0)), at(t0, 8_000)),
            LivenessVerdict::Timeout
        );
        let v = s.update(None, at(t0, 9_000));
        assert_eq!(v.reason(), "LIVENESS_TIMEOUT");
    }

    #[test]
    fn test_timeout_beats_passing_frame() {
        let (mut s, t0) = session(Challenge::TurnLeft);
        assert_eq!(
            s.update(Some(&face(0.3, 0.1)), at(t0, 8_500)),
            LivenessVerdict::Timeout
        );
        assert!(!s.is_completed());
    }

    #[test]
    fn test_reset_clears_blink_state() {
        let (mut s, t0) = session(Challenge::Blink);
        s.update(Some(&face(0.10, 0.0)), at(t0, 0));
        let mut rng = StdRng::seed_from_u64(7);
        s.reset_with(&mut rng, at(t0, 100));
        assert_eq!(s.blink_count(), 0);
        assert!(!s.is_completed());
        assert!(!s.is_timed_out(at(t0, 8_099)));
        assert!(s.is_timed_out(at(t0, 8_100)));
    }

    #[test]
    fn test_random_challenge_covers_all_kinds() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen = [false; 3];
        for _ in 0..200 {
            let c = Challenge::random(&mut rng);
            let i = Challenge::ALL.iter().position(|k| *k == c).unwrap();
            seen[i] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_instruction_names_challenge() {
        let (s, _) = session(Challenge::TurnRight);
        assert_eq!(s.instruction(), "Liveness: TURN_RIGHT");
    }
}
