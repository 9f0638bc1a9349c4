use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ConsoleError;

/// Verification state of a registration.
///
/// Transitions are not constrained: any status may overwrite any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RegistrationStatus {
    #[default]
    #[serde(rename = "Pending Verification")]
    PendingVerification,
    Verified,
    Rejected,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::PendingVerification => "Pending Verification",
            RegistrationStatus::Verified => "Verified",
            RegistrationStatus::Rejected => "Rejected",
        }
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistrationStatus {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending Verification" => Ok(RegistrationStatus::PendingVerification),
            "Verified" => Ok(RegistrationStatus::Verified),
            "Rejected" => Ok(RegistrationStatus::Rejected),
            other => Err(ConsoleError::Malformed(format!("unknown status '{}'", other))),
        }
    }
}

/// Attendance record of one member for one event.
///
/// Entries are only ever added (with `attended: true`) or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEntry {
    pub attended: bool,
    /// ISO-8601 time the member was marked present
    pub timestamp: String,
}

/// One person within a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TeamMember {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub college: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub year: String,
    #[serde(default, deserialize_with = "event_list")]
    pub events: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attendance: Option<BTreeMap<String, AttendanceEntry>>,
}

impl TeamMember {
    pub fn is_registered_for(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }

    pub fn has_attended(&self, event: &str) -> bool {
        self.attendance_for(event).is_some_and(|a| a.attended)
    }

    pub fn attendance_for(&self, event: &str) -> Option<&AttendanceEntry> {
        self.attendance.as_ref().and_then(|a| a.get(event))
    }
}

/// One submitted team or individual entry, as stored in the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Backend-assigned document id
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub college: String,
    #[serde(default)]
    pub department: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<TeamMember>>,
    #[serde(default, deserialize_with = "event_list")]
    pub events: Vec<String>,
    #[serde(default)]
    pub transaction_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upi_name: Option<String>,
    #[serde(default)]
    pub status: RegistrationStatus,
    /// Client-side ISO timestamp of the submission
    #[serde(default)]
    pub registration_date: String,
    /// Backend-assigned creation time, used for feed ordering
    pub server_timestamp: DateTime<Utc>,
}

impl Registration {
    pub fn is_verified(&self) -> bool {
        self.status == RegistrationStatus::Verified
    }

    /// The member list, or a single member standing in for the team lead
    /// when the registration carries no explicit list.
    pub fn roster(&self) -> Vec<TeamMember> {
        match &self.members {
            Some(members) => members.clone(),
            None => vec![TeamMember {
                name: self.name.clone(),
                email: self.email.clone(),
                phone: self.phone.clone(),
                college: self.college.clone(),
                department: self.department.clone(),
                year: String::new(),
                events: self.events.clone(),
                attendance: None,
            }],
        }
    }

    pub fn member(&self, index: usize) -> Option<&TeamMember> {
        self.members.as_ref().and_then(|m| m.get(index))
    }

    pub fn member_count(&self) -> usize {
        self.members.as_ref().map_or(1, |m| m.len())
    }
}

/// A public submission before the backend assigns id, status and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewRegistration {
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub college: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub members: Option<Vec<TeamMember>>,
    #[serde(default, deserialize_with = "event_list")]
    pub events: Vec<String>,
    #[serde(default)]
    pub transaction_id: String,
    #[serde(default)]
    pub upi_name: Option<String>,
}

lazy_static! {
    static ref HTML_TAG: Regex = Regex::new(r"<[^>]*>").unwrap();
    static ref ANGLE: Regex = Regex::new(r"[<>]").unwrap();
}

/// Strip markup, trim, and cut to at most `max_len` characters.
pub fn sanitize_input(value: &str, max_len: usize) -> String {
    let stripped = HTML_TAG.replace_all(value, "");
    let stripped = ANGLE.replace_all(&stripped, "");
    stripped.trim().chars().take(max_len).collect()
}

fn sanitize_events(events: &[String]) -> Vec<String> {
    events.iter().map(|e| sanitize_input(e, 50)).collect()
}

fn sanitize_member(m: &TeamMember) -> TeamMember {
    TeamMember {
        name: sanitize_input(&m.name, 100),
        email: sanitize_input(&m.email, 100),
        phone: sanitize_input(&m.phone, 15),
        college: sanitize_input(&m.college, 150),
        department: sanitize_input(&m.department, 100),
        year: sanitize_input(&m.year, 20),
        events: sanitize_events(&m.events),
        attendance: m.attendance.clone(),
    }
}

impl NewRegistration {
    /// Returns a copy with every free-text field cleaned.
    pub fn sanitize(&self) -> NewRegistration {
        NewRegistration {
            name: sanitize_input(&self.name, 100),
            email: sanitize_input(&self.email, 100),
            phone: sanitize_input(&self.phone, 15),
            college: sanitize_input(&self.college, 150),
            department: sanitize_input(&self.department, 100),
            members: self
                .members
                .as_ref()
                .map(|ms| ms.iter().map(sanitize_member).collect()),
            events: sanitize_events(&self.events),
            transaction_id: sanitize_input(&self.transaction_id, 50),
            upi_name: self.upi_name.as_deref().map(|u| sanitize_input(u, 100)),
        }
    }
}

/// Accepts `"Quiz"`, `["Quiz", "Chess"]` or `null` and always yields a list.
fn event_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(s)) if s.is_empty() => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
        None => Vec::new(),
    })
}
