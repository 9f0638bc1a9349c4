use serde::Serialize;
use std::future::Future;
use std::time::Duration;

use crate::backend::RegistrationBackend;
use crate::config::EventDetails;
use crate::error::Result;
use crate::payload::{EMAIL_QR_SIZE, QrEndpoint, ScanPayload};
use crate::registration::{Registration, RegistrationStatus};
use crate::store::RegistrationStore;

/// Template parameters of one verification email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationEmail {
    pub to_name: String,
    pub to_email: String,
    pub transaction_id: String,
    pub qr_code_url: String,
    pub event_date: String,
    pub event_time: String,
    pub event_venue: String,
    pub message: String,
}

/// Delivery channel for verification emails.
pub trait MailTransport: Send + Sync {
    fn send(&self, email: &VerificationEmail) -> impl Future<Output = Result<()>> + Send;
}

/// How many of the verification emails went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NotificationReport {
    pub sent: usize,
    pub total: usize,
}

impl NotificationReport {
    pub fn all_sent(&self) -> bool {
        self.sent == self.total
    }

    pub fn message(&self) -> String {
        if self.all_sent() {
            format!("Sent all {} verification emails!", self.sent)
        } else {
            format!("Sent {}/{} emails. Some failed.", self.sent, self.total)
        }
    }
}

/// Sends one verification email per roster member, one at a time.
pub struct Notifier<T> {
    transport: T,
    qr: QrEndpoint,
    event: EventDetails,
    delay: Duration,
}

impl<T: MailTransport> Notifier<T> {
    pub fn new(transport: T, qr: QrEndpoint, event: EventDetails, delay: Duration) -> Self {
        Notifier {
            transport,
            qr,
            event,
            delay,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Email every member of `reg` its own QR code
    ///
    /// Sends are sequential with a fixed pause in between. A failed send is
    /// logged and counted, never retried.
    pub async fn notify(&self, reg: &Registration) -> NotificationReport {
        let payloads = ScanPayload::for_registration(reg);
        let roster = reg.roster();
        let total = roster.len();
        let mut sent = 0;

        for (i, (member, payload)) in roster.iter().zip(payloads.iter()).enumerate() {
            if i > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let email = VerificationEmail {
                to_name: member.name.clone(),
                to_email: member.email.clone(),
                transaction_id: reg.transaction_id.clone(),
                qr_code_url: self.qr.url(EMAIL_QR_SIZE, &payload.to_text(), None),
                event_date: self.event.date.clone(),
                event_time: self.event.time.clone(),
                event_venue: self.event.venue.clone(),
                message: self.event.message.clone(),
            };

            match self.transport.send(&email).await {
                Ok(()) => {
                    log::info!("Sent verification email to {} (index {})", member.name, i);
                    sent += 1;
                }
                Err(e) => log::warn!("Verification email to {} failed: {}", member.name, e),
            }
        }

        log::info!("Verification emails for {}: {}/{} sent", reg.id, sent, total);
        NotificationReport { sent, total }
    }
}

/// Persist a status change and, for `Verified`, notify every member
///
/// The registration is read from the cache before the write. When it is not
/// cached the status is still written but no email is sent.
///
/// # Returns
/// * `Ok(Some(report))` - Verified and emails attempted
/// * `Ok(None)` - Any other status, or nothing cached to notify
///
/// # Errors
/// * Returns the backend error if the status write fails; no email is sent
pub async fn update_status<T: MailTransport>(
    backend: &dyn RegistrationBackend,
    store: &RegistrationStore,
    notifier: &Notifier<T>,
    id: &str,
    status: RegistrationStatus,
) -> Result<Option<NotificationReport>> {
    let cached = store.find(id);

    backend.update_status(id, status).map_err(|e| {
        log::error!("Failed to update status of {}: {}", id, e);
        e
    })?;
    log::info!("Status of {} set to {}", id, status);

    if status != RegistrationStatus::Verified {
        return Ok(None);
    }
    match cached {
        Some(reg) => Ok(Some(notifier.notify(&reg).await)),
        None => {
            log::error!("Registration {} missing from cache after status update", id);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::JsonFileBackend;
    use crate::error::ConsoleError;
    use crate::registration::{NewRegistration, TeamMember};
    use std::sync::Mutex;

    /// Transport recording every email, failing for one address.
    #[derive(Default)]
    struct Outbox {
        fail_for: Option<String>,
        sent: Mutex<Vec<VerificationEmail>>,
    }

    impl MailTransport for Outbox {
        async fn send(&self, email: &VerificationEmail) -> Result<()> {
            if self.fail_for.as_deref() == Some(email.to_email.as_str()) {
                return Err(ConsoleError::Mail("mailbox unavailable".into()));
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    fn notifier(outbox: Outbox) -> Notifier<Outbox> {
        Notifier::new(
            outbox,
            QrEndpoint::new("https://qr.test/"),
            EventDetails::default(),
            Duration::ZERO,
        )
    }

    fn member(name: &str) -> TeamMember {
        TeamMember {
            name: name.to_string(),
            email: format!("{}@mail.test", name.to_lowercase()),
            events: vec!["Quiz".to_string()],
            ..Default::default()
        }
    }

    fn team(backend: &JsonFileBackend, members: Option<Vec<TeamMember>>) -> (String, RegistrationStore) {
        let id = backend
            .create(NewRegistration {
                name: "Lead".to_string(),
                email: "lead@mail.test".to_string(),
                transaction_id: "TX9".to_string(),
                events: vec!["Quiz".to_string()],
                members,
                ..Default::default()
            })
            .unwrap();
        let store = RegistrationStore::new();
        store.seed(backend.subscribe().borrow().to_vec());
        (id, store)
    }

    #[tokio::test]
    async fn one_email_per_member_with_own_payload() {
        let backend = JsonFileBackend::in_memory();
        let (id, store) = team(&backend, Some(vec![member("Ann"), member("Bob"), member("Cy")]));
        let n = notifier(Outbox {
            fail_for: Some("bob@mail.test".to_string()),
            ..Default::default()
        });

        let report = update_status(&backend, &store, &n, &id, RegistrationStatus::Verified)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report, NotificationReport { sent: 2, total: 3 });
        assert_eq!(report.message(), "Sent 2/3 emails. Some failed.");

        let sent = n.transport().sent.lock().unwrap();
        assert_eq!(sent[0].to_name, "Ann");
        assert_eq!(sent[1].to_name, "Cy");
        assert!(sent[1].qr_code_url.contains("size=250x250"));
        assert!(sent[1].qr_code_url.contains("%22index%22%3A2"));
        assert_eq!(sent[0].transaction_id, "TX9");
        assert!(backend.subscribe().borrow()[0].is_verified());
    }

    #[tokio::test]
    async fn lead_is_notified_without_member_list() {
        let backend = JsonFileBackend::in_memory();
        let (id, store) = team(&backend, None);
        let n = notifier(Outbox::default());

        let report = update_status(&backend, &store, &n, &id, RegistrationStatus::Verified)
            .await
            .unwrap()
            .unwrap();
        assert!(report.all_sent());
        assert_eq!(n.transport().sent.lock().unwrap()[0].to_email, "lead@mail.test");
    }

    #[tokio::test]
    async fn other_statuses_and_failed_writes_send_nothing() {
        let backend = JsonFileBackend::in_memory();
        let (id, store) = team(&backend, Some(vec![member("Ann")]));
        let n = notifier(Outbox::default());

        let none = update_status(&backend, &store, &n, &id, RegistrationStatus::Rejected)
            .await
            .unwrap();
        assert!(none.is_none());

        let err = update_status(&backend, &store, &n, "missing", RegistrationStatus::Verified).await;
        assert!(matches!(err, Err(ConsoleError::NotFound(_))));
        assert!(n.transport().sent.lock().unwrap().is_empty());
    }
}
