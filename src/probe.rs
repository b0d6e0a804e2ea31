use crate::driver::{DriverError, WifiDriver};
use tokio::time::Instant;

/// One point-in-time reading of link activity. Produced fresh per probe,
/// never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivitySample {
    pub taken_at: Instant,
    /// Frames queued or in flight at the instant of the probe.
    pub pending_traffic: bool,
    pub tx_total: u64,
    pub rx_total: u64,
    /// Sum of the error-class counters; motion here counts as activity too,
    /// since a bus that is failing is not a bus that is idle.
    pub bus_errors: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("driver stats query failed: {0}")]
    Query(#[from] DriverError),
}

/// Query the driver for pending traffic and counter positions. Pure read;
/// all window bookkeeping lives in the tracker.
pub fn sample<D: WifiDriver>(driver: &D) -> Result<ActivitySample, ProbeError> {
    let stats = driver.bus_stats()?;
    Ok(ActivitySample {
        taken_at: Instant::now(),
        pending_traffic: driver.pending_traffic(),
        tx_total: stats.tx_total,
        rx_total: stats.rx_total,
        bus_errors: stats.tx_fail + stats.cmd52_fails + stats.cmd53_fails + stats.error_intrs,
    })
}
