use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

use crate::registration::Registration;

/// The member currently shown to the operator after a scan.
///
/// A pure focus pointer into the cache; holding one never mutates anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFocus {
    pub registration_id: String,
    pub member_index: usize,
}

/// Classification of one decoded QR text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanOutcome {
    /// Not JSON, or no usable `id` field
    Malformed,
    NotFound { id: String },
    /// The registration exists but its payment is not verified
    PaymentNotVerified { id: String },
    Selected(ScanFocus),
}

impl ScanOutcome {
    pub fn message(&self) -> String {
        match self {
            ScanOutcome::Malformed => "Invalid QR format".to_string(),
            ScanOutcome::NotFound { .. } => "Participant not found".to_string(),
            ScanOutcome::PaymentNotVerified { .. } => "Payment not verified!".to_string(),
            ScanOutcome::Selected(_) => "Participant found".to_string(),
        }
    }
}

/// Parse `raw` and look it up in `registrations`
///
/// Only the in-memory snapshot is consulted, never the backend.
///
/// # Arguments
/// * `raw` - Text exactly as decoded from the QR code
/// * `registrations` - Current contents of the registration cache
///
/// # Returns
/// * `ScanOutcome` - `Selected` only for a verified registration
pub fn resolve_scan(raw: &str, registrations: &[Registration]) -> ScanOutcome {
    let value: Value = match serde_json::from_str(raw.trim()) {
        Ok(value) => value,
        Err(_) => return ScanOutcome::Malformed,
    };

    let id = match value.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id,
        _ => return ScanOutcome::Malformed,
    };

    let member_index = match value.get("index") {
        None | Some(Value::Null) => 0,
        Some(index) => match whole_index(index) {
            Some(i) => i,
            None => return ScanOutcome::Malformed,
        },
    };

    match registrations.iter().find(|r| r.id == id) {
        None => ScanOutcome::NotFound { id: id.to_string() },
        Some(reg) if !reg.is_verified() => ScanOutcome::PaymentNotVerified { id: id.to_string() },
        Some(reg) => ScanOutcome::Selected(ScanFocus {
            registration_id: reg.id.clone(),
            member_index,
        }),
    }
}

/// A non-negative integer, also written as a float with no fractional part (`0.0`).
fn whole_index(index: &Value) -> Option<usize> {
    index.as_u64().map(|i| i as usize).or_else(|| {
        index
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u32::MAX as f64)
            .map(|f| f as usize)
    })
}

/// Whether the focused member can be marked present for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    AlreadyPresent,
    NotRegistered,
    /// The index points past the member list, or there is no list
    MemberMissing,
    PaymentNotVerified,
}

impl Readiness {
    pub fn can_mark(&self) -> bool {
        *self == Readiness::Ready
    }
}

pub fn assess(reg: &Registration, member_index: usize, event: &str) -> Readiness {
    if !reg.is_verified() {
        return Readiness::PaymentNotVerified;
    }
    match reg.member(member_index) {
        None => Readiness::MemberMissing,
        Some(m) if !m.is_registered_for(event) => Readiness::NotRegistered,
        Some(m) if m.has_attended(event) => Readiness::AlreadyPresent,
        Some(_) => Readiness::Ready,
    }
}

/// One line of the recent-scans panel.
#[derive(Debug, Clone, Serialize)]
pub struct ScanRecord {
    pub name: String,
    pub event: String,
    pub success: bool,
    pub time: String,
    pub message: String,
}

impl ScanRecord {
    pub fn new(name: &str, event: &str, success: bool, message: &str) -> Self {
        ScanRecord {
            name: name.to_string(),
            event: event.to_string(),
            success,
            time: local_time(&Utc::now()),
            message: message.to_string(),
        }
    }
}

pub fn local_time(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%I:%M:%S %p").to_string()
}

const SCAN_LOG_LEN: usize = 5;

/// Most recent scan results, newest first, capped at five.
#[derive(Debug, Clone, Default)]
pub struct ScanLog {
    entries: VecDeque<ScanRecord>,
}

impl ScanLog {
    pub fn push(&mut self, record: ScanRecord) {
        self.entries.push_front(record);
        self.entries.truncate(SCAN_LOG_LEN);
    }

    pub fn entries(&self) -> Vec<ScanRecord> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::RegistrationStatus;

    fn cache() -> Vec<Registration> {
        serde_json::from_str(
            r#"[
            {"id":"R1","name":"Lead","status":"Verified","serverTimestamp":"2026-03-01T10:00:00Z",
             "members":[{"name":"A","events":["Quiz"]},{"name":"B","events":["Quiz","Chess"],
                "attendance":{"Quiz":{"attended":true,"timestamp":"2026-03-13T09:10:00.000Z"}}}]},
            {"id":"R2","name":"Other","status":"Pending Verification","serverTimestamp":"2026-03-01T09:00:00Z",
             "members":[{"name":"C","events":["Quiz"]}]},
            {"id":"R3","name":"Gone","status":"Rejected","serverTimestamp":"2026-03-01T08:00:00Z"}
        ]"#,
        )
        .unwrap()
    }

    #[test]
    fn malformed_payloads() {
        let regs = cache();
        assert_eq!(resolve_scan("not json", &regs), ScanOutcome::Malformed);
        assert_eq!(resolve_scan(r#"{"index":0}"#, &regs), ScanOutcome::Malformed);
        assert_eq!(resolve_scan(r#"{"id":""}"#, &regs), ScanOutcome::Malformed);
        assert_eq!(resolve_scan(r#"{"id":7}"#, &regs), ScanOutcome::Malformed);
        assert_eq!(resolve_scan(r#"{"id":"R1","index":-1}"#, &regs), ScanOutcome::Malformed);
    }

    #[test]
    fn not_found_iff_id_absent_from_cache() {
        let regs = cache();
        for id in ["R1", "R2", "R3", "R4", "r1"] {
            let outcome = resolve_scan(&format!(r#"{{"id":"{}","index":0}}"#, id), &regs);
            let known = regs.iter().any(|r| r.id == id);
            assert_eq!(matches!(outcome, ScanOutcome::NotFound { .. }), !known, "{}", id);
        }
    }

    #[test]
    fn unverified_never_selected() {
        let mut regs = cache();
        for status in [RegistrationStatus::PendingVerification, RegistrationStatus::Rejected] {
            regs[0].status = status;
            for index in 0..3 {
                let raw = format!(r#"{{"id":"R1","index":{}}}"#, index);
                assert_eq!(
                    resolve_scan(&raw, &regs),
                    ScanOutcome::PaymentNotVerified { id: "R1".to_string() }
                );
            }
            assert_eq!(assess(&regs[0], 0, "Quiz"), Readiness::PaymentNotVerified);
        }
    }

    #[test]
    fn selects_member_and_defaults_index() {
        let regs = cache();
        let outcome = resolve_scan(r#"{"id":"R1","index":1,"name":"B","events":["Quiz"]}"#, &regs);
        assert_eq!(
            outcome,
            ScanOutcome::Selected(ScanFocus {
                registration_id: "R1".to_string(),
                member_index: 1
            })
        );

        match resolve_scan(r#"{"id":"R1"}"#, &regs) {
            ScanOutcome::Selected(focus) => assert_eq!(focus.member_index, 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn integral_float_index_selects_member() {
        let regs = cache();
        assert_eq!(
            resolve_scan(r#"{"id":"R1","index":1.0}"#, &regs),
            ScanOutcome::Selected(ScanFocus {
                registration_id: "R1".to_string(),
                member_index: 1
            })
        );
        assert_eq!(resolve_scan(r#"{"id":"R1","index":0.5}"#, &regs), ScanOutcome::Malformed);
        assert_eq!(resolve_scan(r#"{"id":"R1","index":-2.0}"#, &regs), ScanOutcome::Malformed);
    }

    #[test]
    fn readiness_for_event() {
        let regs = cache();
        assert_eq!(assess(&regs[0], 0, "Quiz"), Readiness::Ready);
        assert_eq!(assess(&regs[0], 0, "Chess"), Readiness::NotRegistered);
        assert_eq!(assess(&regs[0], 1, "Quiz"), Readiness::AlreadyPresent);
        assert_eq!(assess(&regs[0], 5, "Quiz"), Readiness::MemberMissing);
        assert!(!assess(&regs[0], 0, "Chess").can_mark());
    }

    #[test]
    fn scan_log_keeps_five_newest() {
        let mut log = ScanLog::default();
        for i in 0..7 {
            log.push(ScanRecord::new(&format!("P{}", i), "Quiz", true, "Present"));
        }
        let entries = log.entries();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].name, "P6");
        assert_eq!(entries[4].name, "P2");
    }
}
