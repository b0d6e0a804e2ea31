use crate::config::MonitorConfig;
use crate::probe::ActivitySample;
use std::time::Duration;
use tokio::time::Instant;

/// What the tracker concluded from the latest sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// The link has been continuously idle for this long.
    Idle(Duration),
    Active,
}

/// Tracks how long the link has been continuously idle.
///
/// Activity is either the instantaneous pending-traffic flag or any counter
/// motion since the previous sample; one signal alone is enough to reset
/// the window. Invariant: `last_activity >= window_start`.
pub struct InactivityWindowTracker {
    window_start: Instant,
    last_activity: Instant,
    baseline: Option<(u64, u64, u64)>,
}

impl InactivityWindowTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            last_activity: now,
            baseline: None,
        }
    }

    /// Feed one sample. Observing the same instant twice with no new
    /// traffic reports the same idle duration (no double counting).
    pub fn observe(&mut self, sample: &ActivitySample) -> WindowState {
        let counters = (sample.tx_total, sample.rx_total, sample.bus_errors);
        // With no baseline there is no way to tell idle from unseen
        // traffic, so the first sample always counts as activity.
        let moved = self.baseline.map_or(true, |b| b != counters);
        self.baseline = Some(counters);

        if sample.pending_traffic || moved {
            self.window_start = sample.taken_at;
            self.last_activity = sample.taken_at;
            WindowState::Active
        } else {
            WindowState::Idle(sample.taken_at.duration_since(self.last_activity))
        }
    }

    /// A probe that could not complete is unreliable data; treat it as
    /// activity so an unsound window never qualifies for suspension.
    pub fn note_unreliable(&mut self, now: Instant) {
        self.window_start = now;
        self.last_activity = now;
        self.baseline = None;
    }

    /// How long this window has been under observation.
    pub fn monitored_span(&self, now: Instant) -> Duration {
        now.duration_since(self.window_start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Suspend,
    Continue,
}

#[derive(Debug, Clone, Copy)]
pub struct SuspendPolicy {
    /// Minimum span the window must have been observed for.
    pub interval: Duration,
    /// Continuous idle duration that qualifies for suspension.
    pub idle_window: Duration,
}

impl SuspendPolicy {
    pub fn from_config(cfg: &MonitorConfig) -> Self {
        Self {
            interval: cfg.interval(),
            idle_window: cfg.idle_window(),
        }
    }
}

/// Decides whether an idle streak qualifies the link for suspension.
pub struct SuspendDecisionEngine {
    policy: SuspendPolicy,
}

impl SuspendDecisionEngine {
    pub fn new(policy: SuspendPolicy) -> Self {
        Self { policy }
    }

    /// `Suspend` only once the continuous idle duration has reached the
    /// window AND the span observed covers at least one full interval. A
    /// single instantaneous idle reading is never enough; anything short
    /// of both bars is `Continue`.
    pub fn decide(&self, state: WindowState, monitored_span: Duration) -> Decision {
        match state {
            WindowState::Active => Decision::Continue,
            WindowState::Idle(idle_for) => {
                if idle_for >= self.policy.idle_window && monitored_span >= self.policy.interval {
                    Decision::Suspend
                } else {
                    Decision::Continue
                }
            }
        }
    }
}
