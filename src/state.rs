use crate::link::ConnectionStatus;
use crate::stats::StatsDelta;
use crate::suspend::Phase;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct CoordinatorState {
    pub uptime_secs: u64,
    pub phase: Phase,
    pub link: LinkInfo,
    pub cycles: u64,
    pub suspend_failures: u64,
    pub total_sleep_ms: u64,
    pub last_cycle: Option<CycleSummary>,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct LinkInfo {
    pub status: ConnectionStatus,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub rssi: Option<i32>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct CycleSummary {
    pub outcome: String,
    pub delta: StatsDelta,
}

impl CoordinatorState {
    pub fn shared() -> SharedState {
        Arc::new(Mutex::new(CoordinatorState::default()))
    }
}

// Shared State Container
pub type SharedState = Arc<Mutex<CoordinatorState>>;
