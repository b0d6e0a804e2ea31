use crate::driver::{BusStats, DriverError, WifiDriver};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::info;

/// Immutable point-in-time copy of the firmware counters, bracketed around
/// one sleep interval for delta computation.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub taken_at: Instant,
    pub bus: BusStats,
}

impl StatsSnapshot {
    pub fn capture<D: WifiDriver>(driver: &D) -> Result<Self, DriverError> {
        Ok(Self {
            taken_at: Instant::now(),
            bus: driver.bus_stats()?,
        })
    }
}

/// What one suspend/resume cycle cost and carried. Every field is a
/// clamped difference: counter wraparound across a very long sleep yields
/// zero, never an underflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsDelta {
    pub sleep_ms: u64,
    pub tx_total: u64,
    pub rx_total: u64,
    pub tx_no_mem: u64,
    pub rx_no_mem: u64,
    pub tx_fail: u64,
    pub no_credit: u64,
    pub flow_control: u64,
    pub cmd52_reads: u64,
    pub cmd52_writes: u64,
    pub cmd53_reads: u64,
    pub cmd53_writes: u64,
    pub cmd52_fails: u64,
    pub cmd53_fails: u64,
    pub oob_intrs: u64,
    pub sdio_intrs: u64,
    pub error_intrs: u64,
}

impl StatsDelta {
    pub fn between(before: &StatsSnapshot, after: &StatsSnapshot) -> Self {
        let (b, a) = (&before.bus, &after.bus);
        Self {
            sleep_ms: after
                .taken_at
                .duration_since(before.taken_at)
                .as_millis() as u64,
            tx_total: a.tx_total.saturating_sub(b.tx_total),
            rx_total: a.rx_total.saturating_sub(b.rx_total),
            tx_no_mem: a.tx_no_mem.saturating_sub(b.tx_no_mem),
            rx_no_mem: a.rx_no_mem.saturating_sub(b.rx_no_mem),
            tx_fail: a.tx_fail.saturating_sub(b.tx_fail),
            no_credit: a.no_credit.saturating_sub(b.no_credit),
            flow_control: a.flow_control.saturating_sub(b.flow_control),
            cmd52_reads: a.cmd52_reads.saturating_sub(b.cmd52_reads),
            cmd52_writes: a.cmd52_writes.saturating_sub(b.cmd52_writes),
            cmd53_reads: a.cmd53_reads.saturating_sub(b.cmd53_reads),
            cmd53_writes: a.cmd53_writes.saturating_sub(b.cmd53_writes),
            cmd52_fails: a.cmd52_fails.saturating_sub(b.cmd52_fails),
            cmd53_fails: a.cmd53_fails.saturating_sub(b.cmd53_fails),
            oob_intrs: a.oob_intrs.saturating_sub(b.oob_intrs),
            sdio_intrs: a.sdio_intrs.saturating_sub(b.sdio_intrs),
            error_intrs: a.error_intrs.saturating_sub(b.error_intrs),
        }
    }

    /// The per-cycle diagnostic report. The field set is the contract;
    /// the formatting is not.
    pub fn log_report(&self) {
        info!("network stack was suspended for {} ms", self.sleep_ms);
        info!(
            "tx_total: {}, rx_total: {}, tx_no_mem: {}, rx_no_mem: {}, tx_fail: {}, no_credit: {}, flow_control: {}",
            self.tx_total,
            self.rx_total,
            self.tx_no_mem,
            self.rx_no_mem,
            self.tx_fail,
            self.no_credit,
            self.flow_control
        );
        info!(
            "cmd52: {} rd / {} wr ({} failed), cmd53: {} rd / {} wr ({} failed)",
            self.cmd52_reads,
            self.cmd52_writes,
            self.cmd52_fails,
            self.cmd53_reads,
            self.cmd53_writes,
            self.cmd53_fails
        );
        info!(
            "interrupts: oob {}, sdio {}, error {}",
            self.oob_intrs, self.sdio_intrs, self.error_intrs
        );
    }
}
