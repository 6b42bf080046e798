// src/core/alarm.rs

//! Alarm records and the fire-and-forget reporter. Debouncing is owned by
//! callers (one atomic flag per category); this module only shapes and
//! ships the records.

use crate::core::http::{HttpClient, HttpRequest};
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const ALARM_PATH: &str = "/v1/alarm/report";
const ALARM_TIMEOUT: Duration = Duration::from_secs(5);
const ORIGIN_SYSTEM: &str = "MindIE";

/// Alarm ids live in the 0xFC001000..=0xFC001007 window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmKind {
    RegisterFailed,
    RankTableStreamInterrupted,
    FaultStreamInterrupted,
    RankTableSaveFailed,
    NodeFaultDetected,
    MembershipChanged,
    RoleSwitchFailed,
    CoordinatorAbnormal,
}

impl AlarmKind {
    pub fn alarm_id(self) -> u32 {
        match self {
            AlarmKind::RegisterFailed => 0xFC00_1000,
            AlarmKind::RankTableStreamInterrupted => 0xFC00_1001,
            AlarmKind::FaultStreamInterrupted => 0xFC00_1002,
            AlarmKind::RankTableSaveFailed => 0xFC00_1003,
            AlarmKind::NodeFaultDetected => 0xFC00_1004,
            AlarmKind::MembershipChanged => 0xFC00_1005,
            AlarmKind::RoleSwitchFailed => 0xFC00_1006,
            AlarmKind::CoordinatorAbnormal => 0xFC00_1007,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AlarmKind::RegisterFailed => "ClusterRegisterFailed",
            AlarmKind::RankTableStreamInterrupted => "RankTableSubscriptionInterrupted",
            AlarmKind::FaultStreamInterrupted => "FaultSubscriptionInterrupted",
            AlarmKind::RankTableSaveFailed => "RankTableSaveFailed",
            AlarmKind::NodeFaultDetected => "NodeFaultDetected",
            AlarmKind::MembershipChanged => "ClusterMembershipChanged",
            AlarmKind::RoleSwitchFailed => "RoleSwitchFailed",
            AlarmKind::CoordinatorAbnormal => "CoordinatorAbnormal",
        }
    }

    pub fn severity(self) -> u8 {
        match self {
            AlarmKind::RegisterFailed => 1,
            AlarmKind::RankTableStreamInterrupted | AlarmKind::FaultStreamInterrupted => 2,
            AlarmKind::RankTableSaveFailed | AlarmKind::RoleSwitchFailed => 2,
            AlarmKind::NodeFaultDetected | AlarmKind::CoordinatorAbnormal => 3,
            AlarmKind::MembershipChanged => 4,
        }
    }
}

/// One alarm record as the alarm manager expects it on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmRecord {
    pub category: u8,
    pub cleared: u8,
    pub clear_category: u8,
    pub occur_utc: String,
    pub occur_time: String,
    pub native_me_dn: String,
    pub origin_system: String,
    pub location: String,
    pub moi: String,
    pub event_type: u8,
    pub alarm_id: u32,
    pub alarm_name: String,
    pub severity: u8,
    pub probable_cause: String,
    pub reason_id: u32,
    pub service_affected_type: u8,
    pub additional_information: String,
    pub match_key: String,
}

impl AlarmRecord {
    /// A raise record; `clear` flips the category and cleared markers.
    pub fn raise(kind: AlarmKind, model_id: &str, location: &str, detail: &str) -> Self {
        Self::build(kind, model_id, location, detail, false)
    }

    pub fn clear(kind: AlarmKind, model_id: &str, location: &str, detail: &str) -> Self {
        Self::build(kind, model_id, location, detail, true)
    }

    fn build(kind: AlarmKind, model_id: &str, location: &str, detail: &str, cleared: bool) -> Self {
        let now_utc = Utc::now();
        Self {
            category: if cleared { 2 } else { 1 },
            cleared: cleared as u8,
            clear_category: 1,
            occur_utc: now_utc.to_rfc3339(),
            occur_time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            native_me_dn: model_id.to_string(),
            origin_system: ORIGIN_SYSTEM.to_string(),
            location: location.to_string(),
            moi: location.to_string(),
            event_type: 1,
            alarm_id: kind.alarm_id(),
            alarm_name: kind.name().to_string(),
            severity: kind.severity(),
            probable_cause: detail.to_string(),
            reason_id: kind.alarm_id() & 0xFF,
            service_affected_type: 0,
            additional_information: detail.to_string(),
            match_key: format!("{:#x}-{}", kind.alarm_id(), location),
        }
    }
}

/// Ships alarm records to the alarm manager; failures are logged, never
/// propagated.
#[derive(Debug, Clone)]
pub struct AlarmReporter {
    client: Option<HttpClient>,
    model_id: String,
    location: String,
}

impl AlarmReporter {
    /// `endpoint` is "host:port"; an empty endpoint disables delivery.
    pub fn new(endpoint: &str, tls: &crate::config::TlsSettings, model_id: &str, location: &str) -> Self {
        let client = endpoint.split_once(':').and_then(|(host, port)| {
            let port: u16 = port.parse().ok()?;
            HttpClient::new(host, port, tls).ok()
        });
        if client.is_none() && !endpoint.is_empty() {
            warn!(%endpoint, "Alarm endpoint is not usable; alarms will be logged only");
        }
        Self {
            client,
            model_id: model_id.to_string(),
            location: location.to_string(),
        }
    }

    pub async fn raise(&self, kind: AlarmKind, detail: &str) {
        self.ship(AlarmRecord::raise(kind, &self.model_id, &self.location, detail))
            .await;
    }

    pub async fn clear(&self, kind: AlarmKind, detail: &str) {
        self.ship(AlarmRecord::clear(kind, &self.model_id, &self.location, detail))
            .await;
    }

    async fn ship(&self, record: AlarmRecord) {
        debug!(alarm = %record.alarm_name, cleared = record.cleared, "Alarm emitted");
        let Some(client) = &self.client else {
            return;
        };
        // The alarm manager consumes a one-record JSON array.
        let request = match HttpRequest::post(ALARM_PATH, &vec![record.clone()], ALARM_TIMEOUT) {
            Ok(r) => r,
            Err(e) => {
                warn!("Alarm encode failed: {e}");
                return;
            }
        };
        if let Err(e) = client.send(&request).await {
            warn!(alarm = %record.alarm_name, "Alarm delivery failed: {e}");
        }
    }
}
