use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::RegistrationBackend;
use crate::error::{ConsoleError, Result};
use crate::registration::{AttendanceEntry, Registration, TeamMember};

/// Result of an attendance mutation that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOutcome {
    /// The member array was rewritten
    Applied,
    /// Nothing to do; no write was issued
    Unchanged,
}

/// Marks and unmarks per-event attendance.
///
/// Both operations read the member list from the backend's current document,
/// not the feed-driven cache, so a desk always sees its own previous write.
/// They edit one member and write the whole array back. Concurrent desks
/// editing the same registration race; the last full-array write wins.
#[derive(Clone)]
pub struct AttendanceDesk {
    backend: Arc<dyn RegistrationBackend>,
}

impl AttendanceDesk {
    pub fn new(backend: Arc<dyn RegistrationBackend>) -> Self {
        AttendanceDesk { backend }
    }

    fn lookup(&self, id: &str) -> Result<Registration> {
        self.backend
            .get(id)
            .ok_or_else(|| ConsoleError::NotFound(id.to_string()))
    }

    /// Record member `index` of registration `id` as present at `event`
    ///
    /// # Returns
    /// * `Ok(Unchanged)` if the member is already marked present
    /// * `Ok(Applied)` after a successful write
    ///
    /// # Errors
    /// * `PaymentNotVerified` - the registration is not verified
    /// * `MemberNotFound` - no member list, or index out of range
    /// * `NotRegistered` - the member did not sign up for `event`
    /// * any backend error from the write
    pub fn mark_attendance(&self, id: &str, index: usize, event: &str) -> Result<MutationOutcome> {
        let reg = self.lookup(id)?;
        if !reg.is_verified() {
            return Err(ConsoleError::PaymentNotVerified(id.to_string()));
        }

        let members = reg.members.unwrap_or_default();
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let updated = match with_attendance(&members, index, event, &timestamp) {
            Edit::Changed(updated) => updated,
            Edit::Unchanged => return Ok(MutationOutcome::Unchanged),
            Edit::NoMember => {
                return Err(ConsoleError::MemberNotFound {
                    id: id.to_string(),
                    index,
                });
            }
            Edit::NotRegistered(name) => {
                return Err(ConsoleError::NotRegistered {
                    name,
                    event: event.to_string(),
                });
            }
        };

        self.persist(id, updated)?;
        log::info!("Marked {}#{} present for {}", id, index, event);
        Ok(MutationOutcome::Applied)
    }

    /// Drop the attendance entry of member `index` for `event`, if any
    ///
    /// A registration without a member list has no entries, so this is a no-op
    /// for it. An index past the end of an existing list is `MemberNotFound`.
    pub fn remove_attendance(&self, id: &str, index: usize, event: &str) -> Result<MutationOutcome> {
        let reg = self.lookup(id)?;
        let Some(members) = reg.members else {
            return Ok(MutationOutcome::Unchanged);
        };

        let updated = match without_attendance(&members, index, event) {
            Edit::Changed(updated) => updated,
            Edit::Unchanged => return Ok(MutationOutcome::Unchanged),
            Edit::NoMember | Edit::NotRegistered(_) => {
                return Err(ConsoleError::MemberNotFound {
                    id: id.to_string(),
                    index,
                });
            }
        };

        self.persist(id, updated)?;
        log::info!("Removed attendance of {}#{} for {}", id, index, event);
        Ok(MutationOutcome::Applied)
    }

    fn persist(&self, id: &str, members: Vec<TeamMember>) -> Result<()> {
        self.backend.update_members(id, members).map_err(|e| {
            log::error!("Failed to update members of {}: {}", id, e);
            e
        })
    }
}

enum Edit {
    Changed(Vec<TeamMember>),
    Unchanged,
    NoMember,
    NotRegistered(String),
}

/// New member array with `event` marked for member `index`.
///
/// Only the attendance map of that one member differs from the input.
fn with_attendance(members: &[TeamMember], index: usize, event: &str, timestamp: &str) -> Edit {
    let Some(member) = members.get(index) else {
        return Edit::NoMember;
    };
    if !member.is_registered_for(event) {
        return Edit::NotRegistered(member.name.clone());
    }
    if member.has_attended(event) {
        return Edit::Unchanged;
    }

    let mut updated = members.to_vec();
    updated[index]
        .attendance
        .get_or_insert_with(BTreeMap::new)
        .insert(
            event.to_string(),
            AttendanceEntry {
                attended: true,
                timestamp: timestamp.to_string(),
            },
        );
    Edit::Changed(updated)
}

fn without_attendance(members: &[TeamMember], index: usize, event: &str) -> Edit {
    let Some(member) = members.get(index) else {
        return Edit::NoMember;
    };
    if member.attendance_for(event).is_none() {
        return Edit::Unchanged;
    }

    let mut updated = members.to_vec();
    if let Some(map) = updated[index].attendance.as_mut() {
        map.remove(event);
    }
    Edit::Changed(updated)
}

/// A member shown in the live attendance list of an event.
#[derive(Debug, Clone, Serialize)]
pub struct PresentMember {
    pub registration_id: String,
    pub member_index: usize,
    pub name: String,
    pub college: String,
    pub timestamp: String,
}

/// Every member marked present for `event`, most recent first.
pub fn present_members(registrations: &[Registration], event: &str) -> Vec<PresentMember> {
    let mut present: Vec<PresentMember> = registrations
        .iter()
        .flat_map(|reg| {
            reg.members
                .iter()
                .flatten()
                .enumerate()
                .filter(|(_, m)| m.has_attended(event))
                .map(|(i, m)| PresentMember {
                    registration_id: reg.id.clone(),
                    member_index: i,
                    name: m.name.clone(),
                    college: m.college.clone(),
                    timestamp: m
                        .attendance_for(event)
                        .map(|a| a.timestamp.clone())
                        .unwrap_or_default(),
                })
        })
        .collect();

    // ISO-8601 UTC strings order chronologically
    present.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    present
}
