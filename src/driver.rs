use crate::config::SecurityType;
use crate::link::ConnectionStatus;
use rand::Rng;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("driver not ready: {0}")]
    NotReady(&'static str),
    #[error("association failed: {0}")]
    JoinFailed(String),
    #[error("bus query failed: {0}")]
    BusQuery(&'static str),
}

/// Per-driver bus and traffic counters, mirroring what the WLAN firmware
/// accumulates over its SDIO bus. Monotonic; the host reads, never resets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
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

/// The WLAN driver surface the coordinator runs against.
///
/// The coordinator borrows the driver for the lifetime of the monitoring
/// loop and only ever reads link state; stack suspension and the low-power
/// wait are the two mutating entry points, and both are explicit.
#[allow(async_fn_in_trait)]
pub trait WifiDriver: Send + Sync {
    fn connection_status(&self) -> ConnectionStatus;
    fn ip_address(&self) -> Option<Ipv4Addr>;
    fn netmask(&self) -> Option<Ipv4Addr>;
    fn gateway(&self) -> Option<Ipv4Addr>;
    fn mac_address(&self) -> String;
    fn rssi(&self) -> i32;

    /// Frames queued or in flight right now.
    fn pending_traffic(&self) -> bool;
    /// Point-in-time copy of the firmware counters.
    fn bus_stats(&self) -> Result<BusStats, DriverError>;

    async fn connect(
        &self,
        ssid: &str,
        password: &str,
        security: SecurityType,
    ) -> Result<(), DriverError>;

    /// Halt host-side stack servicing so the MCU may drop into deep sleep.
    /// Fails if the link is not in a suspendable state.
    async fn suspend_stack(&self) -> Result<(), DriverError>;
    fn resume_stack(&self);

    /// Resolves when the radio raises a wake interrupt for host-bound or
    /// host-originated traffic. This is the only genuine suspension point
    /// the coordinator ever parks in.
    async fn wait_for_traffic(&self);
}

/// Burst timing for the simulated station's background traffic.
#[derive(Debug, Clone, Copy)]
pub struct SimProfile {
    /// Gap between traffic bursts, sampled uniformly from this range (ms).
    pub burst_gap_ms: (u64, u64),
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            burst_gap_ms: (1_000, 20_000),
        }
    }
}

#[derive(Debug, Default)]
struct StationState {
    status: ConnectionStatus,
    ip: Option<Ipv4Addr>,
    netmask: Option<Ipv4Addr>,
    gateway: Option<Ipv4Addr>,
    mac: String,
    rssi: i32,
}

/// Simulated station driver: stands in for real WLAN hardware so the demo
/// binary runs (and suspends) on a developer host. A spawned generator
/// task plays the role of the network: it produces bursts of inbound
/// traffic at random intervals, bumps the firmware counters, and raises
/// the wake interrupt. Packet classes the filter would discard never show
/// up here; the coordinator only ever sees the surviving stream.
pub struct SimStation {
    profile: SimProfile,
    state: RwLock<StationState>,
    counters: StdMutex<BusStats>,
    pending: AtomicBool,
    suspended: AtomicBool,
    wake: Notify,
}

impl SimStation {
    pub fn new(profile: SimProfile) -> Arc<Self> {
        Arc::new(Self {
            profile,
            state: RwLock::new(StationState {
                mac: random_mac(),
                ..StationState::default()
            }),
            counters: StdMutex::new(BusStats::default()),
            pending: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    /// Start the background traffic generator. Runs until the driver is
    /// dropped; bursts only arrive while the link is up.
    pub fn spawn_traffic(self: &Arc<Self>) {
        let station = self.clone();
        tokio::spawn(async move {
            station.run_traffic().await;
        });
    }

    async fn run_traffic(self: Arc<Self>) {
        let (lo, hi) = self.profile.burst_gap_ms;
        loop {
            let gap = rand::thread_rng().gen_range(lo..=hi.max(lo + 1));
            tokio::time::sleep(Duration::from_millis(gap)).await;

            if !self.connection_status().is_up() {
                continue;
            }

            self.pending.store(true, Ordering::SeqCst);
            let frames = rand::thread_rng().gen_range(1..=4u64);
            {
                let mut c = self.counters.lock().unwrap();
                c.rx_total += frames;
                c.cmd53_reads += frames;
                c.sdio_intrs += frames;
                if self.suspended.load(Ordering::SeqCst) {
                    // Host is asleep: delivery rides the out-of-band wake line.
                    c.oob_intrs += 1;
                }
            }
            debug!("sim: {} inbound frame(s)", frames);
            self.wake.notify_waiters();

            // Frames drain quickly once the host is servicing the stack.
            let drain_ms = rand::thread_rng().gen_range(5..=20);
            tokio::time::sleep(Duration::from_millis(drain_ms)).await;
            self.pending.store(false, Ordering::SeqCst);
        }
    }
}

impl WifiDriver for SimStation {
    fn connection_status(&self) -> ConnectionStatus {
        self.state.read().unwrap().status
    }

    fn ip_address(&self) -> Option<Ipv4Addr> {
        self.state.read().unwrap().ip
    }

    fn netmask(&self) -> Option<Ipv4Addr> {
        self.state.read().unwrap().netmask
    }

    fn gateway(&self) -> Option<Ipv4Addr> {
        self.state.read().unwrap().gateway
    }

    fn mac_address(&self) -> String {
        self.state.read().unwrap().mac.clone()
    }

    fn rssi(&self) -> i32 {
        self.state.read().unwrap().rssi
    }

    fn pending_traffic(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    fn bus_stats(&self) -> Result<BusStats, DriverError> {
        self.counters
            .lock()
            .map(|c| *c)
            .map_err(|_| DriverError::BusQuery("counter lock poisoned"))
    }

    async fn connect(
        &self,
        ssid: &str,
        password: &str,
        security: SecurityType,
    ) -> Result<(), DriverError> {
        if ssid.is_empty() {
            return Err(DriverError::JoinFailed("empty ssid".into()));
        }
        if password.is_empty() && security != SecurityType::Open {
            return Err(DriverError::JoinFailed(format!(
                "{:?} network requires a password",
                security
            )));
        }

        self.state.write().unwrap().status = ConnectionStatus::Connecting;
        info!("sim: associating with '{}' ({:?})", ssid, security);
        // Association + DHCP round trips.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let host: u8 = rand::thread_rng().gen_range(2..=250);
        let mut state = self.state.write().unwrap();
        state.ip = Some(Ipv4Addr::new(192, 168, 1, host));
        state.netmask = Some(Ipv4Addr::new(255, 255, 255, 0));
        state.gateway = Some(Ipv4Addr::new(192, 168, 1, 1));
        state.rssi = rand::thread_rng().gen_range(-70..=-40);
        state.status = ConnectionStatus::GlobalUp;

        let mut c = self.counters.lock().unwrap();
        // Association/DHCP control chatter over the bus.
        c.tx_total += 6;
        c.rx_total += 6;
        c.cmd52_writes += 12;
        c.cmd53_writes += 6;
        c.cmd53_reads += 6;
        c.sdio_intrs += 6;
        Ok(())
    }

    async fn suspend_stack(&self) -> Result<(), DriverError> {
        if !self.connection_status().is_up() {
            return Err(DriverError::NotReady("link is not up"));
        }
        self.suspended.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume_stack(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    async fn wait_for_traffic(&self) {
        loop {
            // Arm before checking, or a burst between check and await is lost.
            let notified = self.wake.notified();
            if self.pending.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
            return;
        }
    }
}

fn random_mac() -> String {
    let mut rng = rand::thread_rng();
    // Locally administered unicast.
    format!(
        "02:00:{:02x}:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_connect_brings_link_up() {
        let station = SimStation::new(SimProfile::default());
        assert_eq!(station.connection_status(), ConnectionStatus::Disconnected);

        station
            .connect("lab-ap", "hunter22", SecurityType::Wpa2)
            .await
            .unwrap();

        assert_eq!(station.connection_status(), ConnectionStatus::GlobalUp);
        assert!(station.ip_address().is_some());
        assert!(station.gateway().is_some());
        assert!(station.rssi() < 0);
        assert!(station.bus_stats().unwrap().tx_total > 0);
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_password() {
        let station = SimStation::new(SimProfile::default());
        let err = station
            .connect("lab-ap", "", SecurityType::Wpa2)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::JoinFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_requires_link_up() {
        let station = SimStation::new(SimProfile::default());
        let err = station.suspend_stack().await.unwrap_err();
        assert!(matches!(err, DriverError::NotReady(_)));

        station
            .connect("lab-ap", "pw", SecurityType::Wpa2)
            .await
            .unwrap();
        station.suspend_stack().await.unwrap();
        station.resume_stack();
    }

    #[tokio::test]
    async fn test_wake_fires_on_notify() {
        let station = SimStation::new(SimProfile::default());
        let waiter = station.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_traffic().await });

        // Give the waiter a chance to park first.
        tokio::task::yield_now().await;
        station.pending.store(true, Ordering::SeqCst);
        station.wake.notify_waiters();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("wake should fire")
            .unwrap();
    }
}
