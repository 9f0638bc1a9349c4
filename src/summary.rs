use serde::Serialize;
use std::collections::BTreeSet;

use crate::registration::{Registration, RegistrationStatus};

/// Dashboard counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    /// Members across all registrations (a registration without a list counts as one)
    pub total_members: usize,
    /// Members of verified registrations
    pub verified_members: usize,
    /// Registrations still awaiting verification
    pub pending_registrations: usize,
}

pub fn stats(registrations: &[Registration]) -> DashboardStats {
    registrations
        .iter()
        .fold(DashboardStats::default(), |mut acc, reg| {
            let members = reg.member_count();
            acc.total_members += members;
            match reg.status {
                RegistrationStatus::Verified => acc.verified_members += members,
                RegistrationStatus::PendingVerification => acc.pending_registrations += 1,
                RegistrationStatus::Rejected => {}
            }
            acc
        })
}

/// Registrations whose lead name, college or transaction id contains `query`,
/// ignoring case. An empty query matches everything.
pub fn search<'a>(registrations: &'a [Registration], query: &str) -> Vec<&'a Registration> {
    let needle = query.trim().to_lowercase();
    registrations
        .iter()
        .filter(|reg| {
            needle.is_empty()
                || [&reg.name, &reg.college, &reg.transaction_id]
                    .iter()
                    .any(|field| field.to_lowercase().contains(&needle))
        })
        .collect()
}

/// Every event name any member signed up for, sorted and deduplicated.
pub fn distinct_events(registrations: &[Registration]) -> Vec<String> {
    let events: BTreeSet<String> = registrations
        .iter()
        .flat_map(|reg| reg.roster())
        .flat_map(|m| m.events)
        .filter(|e| !e.is_empty())
        .collect();
    events.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Registration> {
        serde_json::from_str(
            r#"[
            {"id":"R1","name":"Asha","college":"North College","transactionId":"TX100",
             "status":"Verified","serverTimestamp":"2026-03-01T10:00:00Z",
             "members":[{"name":"A","events":["Quiz","Robotics"]},{"name":"B","events":"Chess"}]},
            {"id":"R2","name":"Ravi","college":"South Institute","transactionId":"TX200",
             "status":"Pending Verification","serverTimestamp":"2026-03-01T09:00:00Z",
             "events":["Quiz"]},
            {"id":"R3","name":"Mei","college":"North College","transactionId":"TX300",
             "status":"Rejected","serverTimestamp":"2026-03-01T08:00:00Z",
             "members":[{"name":"C","events":[]}]}
        ]"#,
        )
        .unwrap()
    }

    #[test]
    fn counts_members_and_pending() {
        let s = stats(&sample());
        assert_eq!(
            s,
            DashboardStats {
                total_members: 4,
                verified_members: 2,
                pending_registrations: 1,
            }
        );
        assert_eq!(stats(&[]), DashboardStats::default());
    }

    #[test]
    fn search_is_case_insensitive() {
        let regs = sample();
        let ids = |q: &str| search(&regs, q).iter().map(|r| r.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids("north"), vec!["R1", "R3"]);
        assert_eq!(ids("tx2"), vec!["R2"]);
        assert_eq!(ids("RAVI"), vec!["R2"]);
        assert_eq!(ids("").len(), 3);
        assert!(ids("nobody").is_empty());
    }

    #[test]
    fn events_are_sorted_and_unique() {
        assert_eq!(distinct_events(&sample()), vec!["Chess", "Quiz", "Robotics"]);
    }
}
