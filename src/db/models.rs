//! Snapshot, alert and aggregate model types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Machine a push is attributed to when it carries no identifier.
pub const DEFAULT_MACHINE_ID: &str = "clawpiscout";

/// Key holding the machine identifier inside stored documents.
pub const MACHINE_KEY: &str = "machine";

/// One machine's point-in-time report.
///
/// Stored and served back as the JSON object the scout sent, with the
/// machine identifier normalized into the `machine` key. Deep fields are
/// not type-checked, so the typed accessors return `None` for sections
/// that are absent or malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(Map<String, Value>);

impl Snapshot {
    /// Wrap an already-validated document, attributing it to `machine_id`.
    pub fn new(mut document: Map<String, Value>, machine_id: &str) -> Self {
        document.insert(MACHINE_KEY.to_string(), Value::String(machine_id.to_string()));
        Self(document)
    }

    pub fn machine_id(&self) -> &str {
        self.0
            .get(MACHINE_KEY)
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_MACHINE_ID)
    }

    /// Report time in seconds since epoch, when it is numeric.
    pub fn ts(&self) -> Option<i64> {
        let ts = self.0.get("ts")?;
        ts.as_i64().or_else(|| ts.as_f64().map(|f| f as i64))
    }

    /// CPU temperature from the system section, even when the rest of
    /// the section is incomplete.
    pub fn cpu_temp(&self) -> Option<f64> {
        self.0.get("system")?.get("cpu_temp")?.as_f64()
    }

    pub fn system(&self) -> Option<SystemStats> {
        self.section("system")
    }

    pub fn gateway(&self) -> Option<GatewayStats> {
        self.section("gateway")
    }

    pub fn sensor(&self) -> Option<SensorStats> {
        self.section("sensor")
    }

    pub fn dashboard(&self) -> Option<DashboardState> {
        self.section("dashboard")
    }

    fn section<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// An alert raised by a scout, tagged with the machine that pushed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertEvent(Map<String, Value>);

impl AlertEvent {
    /// Attach the originating machine, overriding anything the sender set.
    pub fn enrich(mut raw: Map<String, Value>, machine_id: &str) -> Self {
        raw.insert(MACHINE_KEY.to_string(), Value::String(machine_id.to_string()));
        Self(raw)
    }

    pub fn machine_id(&self) -> Option<&str> {
        self.0.get(MACHINE_KEY).and_then(Value::as_str)
    }

    pub fn message(&self) -> Option<&str> {
        self.0.get("message").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayStats {
    pub status: GatewayStatus,
    pub consecutive_ok: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub cpu_temp: f64,
    pub disk_used_pct: f64,
    pub mem_total_mb: i64,
    pub mem_available_mb: i64,
    pub load_avg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorStats {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedState {
    Green,
    Red,
    Yellow,
    Off,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardState {
    pub health_score: u8,
    pub led_state: LedState,
    pub matrix_pattern: String,
}

/// Current snapshot plus sampled history for one machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MachineRecord {
    pub current: Option<Snapshot>,
    /// Oldest first.
    pub history: Vec<Snapshot>,
}

/// The assembled multi-machine read response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateView {
    pub machines: BTreeMap<String, MachineRecord>,
    /// Newest first.
    pub alerts: Vec<AlertEvent>,
    pub monitoring_since: Option<String>,
}

/// Per-machine storage statistics for the status page.
#[derive(Debug, Clone, Serialize)]
pub struct MachineStat {
    pub machine_id: String,
    pub push_count: i64,
    pub history_len: i64,
}
