use crate::config::WifiConfig;
use crate::driver::{DriverError, WifiDriver};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    LocalUp,
    GlobalUp,
    Unsupported,
}

impl ConnectionStatus {
    /// Anything else is "not ready" and monitoring must not begin.
    pub fn is_up(&self) -> bool {
        matches!(self, ConnectionStatus::LocalUp | ConnectionStatus::GlobalUp)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link precondition not met (status {0:?})")]
    PreconditionNotMet(ConnectionStatus),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Bring the station onto the configured AP, or confirm it is already
/// there. On a fresh association the usual identity banner is logged.
pub async fn connect_station<D: WifiDriver>(
    driver: &D,
    wifi: &WifiConfig,
) -> Result<(), LinkError> {
    info!("SSID: {}, Security: {:?}", wifi.ssid, wifi.security);

    let status = driver.connection_status();
    if status != ConnectionStatus::Disconnected {
        return report_existing_connection(driver, status);
    }

    info!("Connecting to {}...", wifi.ssid);
    driver
        .connect(&wifi.ssid, &wifi.password, wifi.security)
        .await?;

    info!("MAC\t : {}", driver.mac_address());
    info!("Netmask\t : {}", fmt_addr(driver.netmask()));
    info!("Gateway\t : {}", fmt_addr(driver.gateway()));
    info!("RSSI\t : {}", driver.rssi());
    info!("IP Addr\t : {}", fmt_addr(driver.ip_address()));
    Ok(())
}

fn report_existing_connection<D: WifiDriver>(
    driver: &D,
    status: ConnectionStatus,
) -> Result<(), LinkError> {
    match status {
        ConnectionStatus::LocalUp | ConnectionStatus::GlobalUp => {
            info!(
                "connection already established ({:?}). IP: {}",
                status,
                fmt_addr(driver.ip_address())
            );
            Ok(())
        }
        other => {
            info!("connection status: {:?}", other);
            Err(LinkError::PreconditionNotMet(other))
        }
    }
}

/// Wait-and-retry until the link reaches an Up state, at the caller's
/// cadence. Gives up after `attempts` checks; the caller decides what a
/// never-satisfied precondition means (for the daemon: exit nonzero, the
/// operator resets the device).
pub async fn await_link_up<D: WifiDriver>(
    driver: &D,
    retry: Duration,
    attempts: u32,
) -> Result<(), LinkError> {
    let mut last = driver.connection_status();
    for _ in 0..attempts {
        last = driver.connection_status();
        if last.is_up() {
            return Ok(());
        }
        debug!("link not ready ({:?}); retrying in {:?}", last, retry);
        tokio::time::sleep(retry).await;
    }
    Err(LinkError::PreconditionNotMet(last))
}

fn fmt_addr(addr: Option<Ipv4Addr>) -> String {
    addr.map_or_else(|| "unknown".to_string(), |a| a.to_string())
}
