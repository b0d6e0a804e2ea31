use crate::config::MonitorConfig;
use crate::driver::{DriverError, WifiDriver};
use crate::monitor::{Decision, InactivityWindowTracker, SuspendDecisionEngine, SuspendPolicy};
use crate::probe;
use crate::state::{CycleSummary, SharedState};
use crate::stats::{StatsDelta, StatsSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Where the coordinator currently is in its loop. Exposed through the
/// state API; `Blocked` is the only phase in which the calling task is
/// genuinely parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Monitoring,
    Deciding,
    Suspending,
    Blocked,
    Resuming,
}

/// Why an external party ended (or preempted) a low-power wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeReason {
    UserRequest,
    Shutdown,
    /// Reserved for platform fault paths that must yank the host awake.
    #[allow(dead_code)]
    Fault(String),
}

impl fmt::Display for WakeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WakeReason::UserRequest => write!(f, "user request"),
            WakeReason::Shutdown => write!(f, "shutdown"),
            WakeReason::Fault(msg) => write!(f, "fault: {msg}"),
        }
    }
}

/// How one low-power wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuspendOutcome {
    TimedOut,
    WokenByTraffic,
    WokenByExternalEvent(WakeReason),
}

impl fmt::Display for SuspendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuspendOutcome::TimedOut => write!(f, "timed out"),
            SuspendOutcome::WokenByTraffic => write!(f, "woken by traffic"),
            SuspendOutcome::WokenByExternalEvent(r) => write!(f, "woken by external event: {r}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SuspendError {
    #[error("suspend primitive failed: {0}")]
    Primitive(DriverError),
    #[error("counter snapshot failed: {0}")]
    Snapshot(DriverError),
}

#[derive(Debug)]
pub enum CycleResult {
    /// A full suspend/resume cycle ran to completion.
    Cycle {
        outcome: SuspendOutcome,
        delta: StatsDelta,
    },
    /// An external event arrived before the link ever suspended.
    Interrupted(WakeReason),
}

/// Drives suspend attempts end to end: monitor, decide, snapshot, park,
/// resume, report. One cooperative task; the driver is borrowed and never
/// closed or reset from here.
pub struct SuspendResumeController<'a, D: WifiDriver> {
    driver: &'a D,
    engine: SuspendDecisionEngine,
    /// Probe cadence inside the monitored interval.
    poll: Duration,
    max_wait: Option<Duration>,
    backoff: Duration,
    link_retry: Duration,
    external: mpsc::Receiver<WakeReason>,
    shared: SharedState,
}

impl<'a, D: WifiDriver> SuspendResumeController<'a, D> {
    pub fn new(
        driver: &'a D,
        cfg: &MonitorConfig,
        external: mpsc::Receiver<WakeReason>,
        shared: SharedState,
    ) -> Self {
        Self {
            driver,
            engine: SuspendDecisionEngine::new(SuspendPolicy::from_config(cfg)),
            // Five looks per interval keeps wake-to-detection latency well
            // under the interval without hot-looping the bus.
            poll: (cfg.interval() / 5).max(Duration::from_millis(10)),
            max_wait: cfg.max_wait(),
            backoff: cfg.backoff(),
            link_retry: cfg.link_retry(),
            external,
            shared,
        }
    }

    /// Attempt suspensions forever. Returns only for an external shutdown;
    /// every error short of that is handled in place.
    pub async fn run(&mut self) -> WakeReason {
        loop {
            if !self.driver.connection_status().is_up() {
                debug!("link not ready; monitoring deferred");
                tokio::select! {
                    biased;
                    Some(reason) = self.external.recv() => {
                        if reason == WakeReason::Shutdown {
                            return reason;
                        }
                    }
                    _ = sleep(self.link_retry) => {}
                }
                continue;
            }

            match self.attempt_suspend().await {
                Ok(CycleResult::Cycle { outcome, delta }) => {
                    debug!("cycle complete: {outcome}, {} ms asleep", delta.sleep_ms);
                    if let SuspendOutcome::WokenByExternalEvent(WakeReason::Shutdown) = outcome {
                        return WakeReason::Shutdown;
                    }
                }
                Ok(CycleResult::Interrupted(reason)) => {
                    if reason == WakeReason::Shutdown {
                        return reason;
                    }
                    debug!("external event ({reason}) while awake; nothing to resume");
                }
                // Already logged and backed off; keep trying to save power.
                Err(e) => debug!("suspend attempt aborted: {e}"),
            }
        }
    }

    /// One end-to-end suspend attempt.
    pub async fn attempt_suspend(&mut self) -> Result<CycleResult, SuspendError> {
        self.set_phase(Phase::Monitoring).await;
        let mut tracker = InactivityWindowTracker::new(Instant::now());

        loop {
            match probe::sample(self.driver) {
                Ok(sample) => {
                    let state = tracker.observe(&sample);
                    self.set_phase(Phase::Deciding).await;
                    let span = tracker.monitored_span(sample.taken_at);
                    if self.engine.decide(state, span) == Decision::Suspend {
                        break;
                    }
                    self.set_phase(Phase::Monitoring).await;
                }
                Err(e) => {
                    // Unreliable data never qualifies a window; start over.
                    warn!("activity probe failed: {e}");
                    tracker.note_unreliable(Instant::now());
                }
            }

            tokio::select! {
                biased;
                Some(reason) = self.external.recv() => {
                    debug!("external event while monitoring: {reason}");
                    return Ok(CycleResult::Interrupted(reason));
                }
                _ = sleep(self.poll) => {}
            }
        }

        // Before-snapshot strictly precedes Blocked; the delta brackets
        // the real sleep interval.
        self.set_phase(Phase::Suspending).await;
        let before = match StatsSnapshot::capture(self.driver) {
            Ok(snap) => snap,
            Err(e) => return self.abort_attempt(SuspendError::Snapshot(e)).await,
        };

        if let Err(e) = self.driver.suspend_stack().await {
            return self.abort_attempt(SuspendError::Primitive(e)).await;
        }

        info!("network stack suspended; host may enter deep sleep");
        self.set_phase(Phase::Blocked).await;
        let outcome = self.block_until_wake().await;

        self.set_phase(Phase::Resuming).await;
        self.driver.resume_stack();
        let after = match StatsSnapshot::capture(self.driver) {
            Ok(snap) => snap,
            Err(e) => {
                // Keep the true sleep duration; the counters read as unchanged.
                warn!("counter snapshot failed after resume: {e}");
                StatsSnapshot {
                    taken_at: Instant::now(),
                    bus: before.bus,
                }
            }
        };

        info!("resuming network stack ({outcome})");
        let delta = StatsDelta::between(&before, &after);
        delta.log_report();
        self.record_cycle(&outcome, &delta).await;
        self.set_phase(Phase::Monitoring).await;
        Ok(CycleResult::Cycle { outcome, delta })
    }

    /// The one real suspension point. External wake outranks both the
    /// traffic interrupt and a clean timeout, so the arms are biased.
    async fn block_until_wake(&mut self) -> SuspendOutcome {
        match self.max_wait {
            Some(max) => tokio::select! {
                biased;
                reason = self.external.recv() => {
                    SuspendOutcome::WokenByExternalEvent(reason.unwrap_or(WakeReason::Shutdown))
                }
                _ = self.driver.wait_for_traffic() => SuspendOutcome::WokenByTraffic,
                _ = sleep(max) => SuspendOutcome::TimedOut,
            },
            None => tokio::select! {
                biased;
                reason = self.external.recv() => {
                    SuspendOutcome::WokenByExternalEvent(reason.unwrap_or(WakeReason::Shutdown))
                }
                _ = self.driver.wait_for_traffic() => SuspendOutcome::WokenByTraffic,
            },
        }
    }

    /// Recoverable failure path: log, back off exactly once, hand the
    /// error up. No immediate retry, so a broken primitive cannot starve
    /// the CPU with a tight suspend/fail loop.
    async fn abort_attempt(&self, err: SuspendError) -> Result<CycleResult, SuspendError> {
        warn!("{err}; backing off {:?}", self.backoff);
        {
            let mut s = self.shared.lock().await;
            s.suspend_failures += 1;
            s.phase = Phase::Monitoring;
        }
        sleep(self.backoff).await;
        Err(err)
    }

    async fn set_phase(&self, phase: Phase) {
        self.shared.lock().await.phase = phase;
    }

    async fn record_cycle(&self, outcome: &SuspendOutcome, delta: &StatsDelta) {
        let mut s = self.shared.lock().await;
        s.cycles += 1;
        s.total_sleep_ms += delta.sleep_ms;
        s.last_cycle = Some(CycleSummary {
            outcome: outcome.to_string(),
            delta: *delta,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::driver::BusStats;
    use crate::link::ConnectionStatus;
    use crate::state::CoordinatorState;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    struct MockDriver {
        stats: StdMutex<BusStats>,
        pending_script: StdMutex<VecDeque<bool>>,
        fail_suspend: AtomicBool,
        suspend_calls: AtomicU32,
        suspended_at: StdMutex<Option<Instant>>,
        traffic: Notify,
    }

    impl MockDriver {
        fn new() -> Self {
            Self {
                stats: StdMutex::new(BusStats::default()),
                pending_script: StdMutex::new(VecDeque::new()),
                fail_suspend: AtomicBool::new(false),
                suspend_calls: AtomicU32::new(0),
                suspended_at: StdMutex::new(None),
                traffic: Notify::new(),
            }
        }

        fn bump_rx(&self, frames: u64) {
            let mut s = self.stats.lock().unwrap();
            s.rx_total += frames;
            s.cmd53_reads += frames;
            s.sdio_intrs += frames;
        }

        fn bump_tx(&self, frames: u64) {
            let mut s = self.stats.lock().unwrap();
            s.tx_total += frames;
            s.cmd53_writes += frames;
        }
    }

    impl WifiDriver for MockDriver {
        fn connection_status(&self) -> ConnectionStatus {
            ConnectionStatus::GlobalUp
        }
        fn ip_address(&self) -> Option<Ipv4Addr> {
            Some(Ipv4Addr::new(192, 168, 1, 10))
        }
        fn netmask(&self) -> Option<Ipv4Addr> {
            None
        }
        fn gateway(&self) -> Option<Ipv4Addr> {
            None
        }
        fn mac_address(&self) -> String {
            "02:00:00:00:00:01".into()
        }
        fn rssi(&self) -> i32 {
            -50
        }
        fn pending_traffic(&self) -> bool {
            self.pending_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(false)
        }
        fn bus_stats(&self) -> Result<BusStats, DriverError> {
            Ok(*self.stats.lock().unwrap())
        }
        async fn connect(
            &self,
            _ssid: &str,
            _password: &str,
            _security: crate::config::SecurityType,
        ) -> Result<(), DriverError> {
            Ok(())
        }
        async fn suspend_stack(&self) -> Result<(), DriverError> {
            self.suspend_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_suspend.load(Ordering::SeqCst) {
                return Err(DriverError::NotReady("wait primitive unavailable"));
            }
            *self.suspended_at.lock().unwrap() = Some(Instant::now());
            Ok(())
        }
        fn resume_stack(&self) {}
        async fn wait_for_traffic(&self) {
            self.traffic.notified().await
        }
    }

    fn cfg(max_wait_ms: Option<u64>) -> MonitorConfig {
        MonitorConfig {
            interval_ms: 500,
            idle_window_ms: 250,
            max_wait_ms,
            backoff_ms: 1000,
            link_retry_ms: 100,
            api_listen: None,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspends_after_quiet_interval_then_times_out() {
        let mock = MockDriver::new();
        let (_tx, rx) = mpsc::channel(4);
        let shared = CoordinatorState::shared();
        let mut ctl = SuspendResumeController::new(&mock, &cfg(Some(2000)), rx, shared);

        let t0 = Instant::now();
        let result = ctl.attempt_suspend().await.unwrap();

        // Idle from the start: the verdict falls at the first evaluation
        // point covering a full interval.
        assert_eq!(
            mock.suspended_at.lock().unwrap().unwrap().duration_since(t0),
            ms(500)
        );
        match result {
            CycleResult::Cycle { outcome, delta } => {
                assert_eq!(outcome, SuspendOutcome::TimedOut);
                assert_eq!(delta.sleep_ms, 2000);
                assert_eq!(delta.rx_total, 0);
            }
            other => panic!("expected a completed cycle, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_wakes_and_deltas_bracket_the_sleep() {
        let mock = MockDriver::new();
        let (_tx, rx) = mpsc::channel(4);
        let shared = CoordinatorState::shared();
        // Unbounded wait: only traffic (or an external event) ends it.
        let mut ctl = SuspendResumeController::new(&mock, &cfg(None), rx, shared);

        let (result, _) = tokio::join!(ctl.attempt_suspend(), async {
            // Monitoring takes 500ms; wake 25203ms into the sleep.
            sleep(ms(500 + 25203)).await;
            mock.bump_rx(3);
            mock.bump_tx(2);
            mock.traffic.notify_waiters();
        });

        match result.unwrap() {
            CycleResult::Cycle { outcome, delta } => {
                assert_eq!(outcome, SuspendOutcome::WokenByTraffic);
                assert_eq!(delta.sleep_ms, 25203);
                assert_eq!(delta.rx_total, 3);
                assert_eq!(delta.tx_total, 2);
                assert_eq!(delta.cmd53_reads, 3);
                assert_eq!(delta.cmd53_writes, 2);
            }
            other => panic!("expected a completed cycle, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_wake_outranks_traffic_and_timeout() {
        let mock = MockDriver::new();
        let (tx, rx) = mpsc::channel(4);
        let shared = CoordinatorState::shared();
        let mut ctl = SuspendResumeController::new(&mock, &cfg(Some(10_000)), rx, shared);

        let (result, _) = tokio::join!(ctl.attempt_suspend(), async {
            sleep(ms(600)).await;
            // Traffic and the external event land together; the external
            // path must win.
            tx.send(WakeReason::UserRequest).await.unwrap();
            mock.bump_rx(1);
            mock.traffic.notify_waiters();
        });

        match result.unwrap() {
            CycleResult::Cycle { outcome, .. } => {
                assert_eq!(
                    outcome,
                    SuspendOutcome::WokenByExternalEvent(WakeReason::UserRequest)
                );
            }
            other => panic!("expected a completed cycle, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_primitive_failure_backs_off_exactly_once() {
        let mock = MockDriver::new();
        mock.fail_suspend.store(true, Ordering::SeqCst);
        let (_tx, rx) = mpsc::channel(4);
        let shared = CoordinatorState::shared();
        let mut ctl = SuspendResumeController::new(&mock, &cfg(Some(2000)), rx, shared.clone());

        let t0 = Instant::now();
        let err = ctl.attempt_suspend().await.unwrap_err();

        assert!(matches!(err, SuspendError::Primitive(_)));
        // One monitoring pass (500ms) plus exactly one backoff (1000ms),
        // and only a single arm of the primitive.
        assert_eq!(t0.elapsed(), ms(1500));
        assert_eq!(mock.suspend_calls.load(Ordering::SeqCst), 1);
        let s = shared.lock().await;
        assert_eq!(s.suspend_failures, 1);
        assert_eq!(s.phase, Phase::Monitoring);
        assert_eq!(s.cycles, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_monitoring_interrupts_without_suspending() {
        let mock = MockDriver::new();
        let (tx, rx) = mpsc::channel(4);
        let shared = CoordinatorState::shared();
        let mut ctl = SuspendResumeController::new(&mock, &cfg(Some(2000)), rx, shared);

        let (result, _) = tokio::join!(ctl.attempt_suspend(), async {
            sleep(ms(250)).await;
            tx.send(WakeReason::Shutdown).await.unwrap();
        });

        match result.unwrap() {
            CycleResult::Interrupted(reason) => assert_eq!(reason, WakeReason::Shutdown),
            other => panic!("expected an interrupt, got {other:?}"),
        }
        assert_eq!(mock.suspend_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loops_cycles_and_stops_on_shutdown() {
        let mock = MockDriver::new();
        let (tx, rx) = mpsc::channel(4);
        let shared = CoordinatorState::shared();
        let mut ctl = SuspendResumeController::new(&mock, &cfg(Some(1000)), rx, shared.clone());

        let (reason, _) = tokio::join!(ctl.run(), async {
            // Cycle one: suspend at 500ms, time out at 1500ms. Shut down
            // partway through the second monitoring pass, before its
            // verdict at 2000ms can fall.
            sleep(ms(1750)).await;
            tx.send(WakeReason::Shutdown).await.unwrap();
        });

        assert_eq!(reason, WakeReason::Shutdown);
        let s = shared.lock().await;
        assert_eq!(s.cycles, 1);
        assert_eq!(s.total_sleep_ms, 1000);
        assert_eq!(s.suspend_failures, 0);
        let last = s.last_cycle.as_ref().unwrap();
        assert_eq!(last.outcome, SuspendOutcome::TimedOut.to_string());
        assert_eq!(last.delta.sleep_ms, 1000);
    }
}
