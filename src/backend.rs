use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{ConsoleError, Result};
use crate::registration::{NewRegistration, Registration, RegistrationStatus, TeamMember};
use crate::saving;

/// Full result set delivered by the live feed, newest registration first.
pub type Snapshot = Arc<Vec<Registration>>;

/// The document collection holding registrations.
///
/// Writers replace whole fields (`status`, the `members` array) and every
/// successful write pushes a fresh [`Snapshot`] to all subscribers. No version
/// check is performed: the last writer wins.
pub trait RegistrationBackend: Send + Sync {
    /// Receiver that always holds the latest snapshot of the collection.
    fn subscribe(&self) -> watch::Receiver<Snapshot>;

    /// The current document, including every write that has already returned.
    fn get(&self, id: &str) -> Option<Registration> {
        self.subscribe().borrow().iter().find(|r| r.id == id).cloned()
    }

    /// Store a new submission and return its document id.
    fn create(&self, new: NewRegistration) -> Result<String>;

    fn update_status(&self, id: &str, status: RegistrationStatus) -> Result<()>;

    /// Replace the whole member array of one registration.
    fn update_members(&self, id: &str, members: Vec<TeamMember>) -> Result<()>;

    fn delete(&self, id: &str) -> Result<()>;
}

/// Registration collection kept in a single JSON file.
///
/// With no path the collection lives in memory only, which is what tests and
/// throwaway demo instances use.
pub struct JsonFileBackend {
    path: Option<PathBuf>,
    docs: Mutex<HashMap<String, Registration>>,
    feed: watch::Sender<Snapshot>,
}

impl JsonFileBackend {
    /// Open (or lazily create) the collection file
    ///
    /// # Arguments
    /// * `path` - JSON file holding the documents, or `None` for memory-only
    ///
    /// # Returns
    /// * `Result<JsonFileBackend>` - The backend with its feed primed with the
    ///   current contents
    ///
    /// # Errors
    /// * Returns an error if the file exists but cannot be read or parsed
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let stored: Vec<Registration> = match &path {
            Some(p) => saving::load_json(p)?.unwrap_or_default(),
            None => Vec::new(),
        };

        let docs: HashMap<String, Registration> =
            stored.into_iter().map(|r| (r.id.clone(), r)).collect();
        let (feed, _) = watch::channel(ordered(&docs));

        if let Some(p) = &path {
            log::info!("Loaded {} registrations from {}", docs.len(), p.display());
        }

        Ok(JsonFileBackend {
            path,
            docs: Mutex::new(docs),
            feed,
        })
    }

    pub fn in_memory() -> Self {
        JsonFileBackend {
            path: None,
            docs: Mutex::new(HashMap::new()),
            feed: watch::channel(Arc::new(Vec::new())).0,
        }
    }

    /// Apply `change` to a copy of the collection, persist it, then publish.
    ///
    /// On any failure the in-memory collection is left untouched.
    fn write<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<String, Registration>) -> Result<()>,
    {
        let mut docs = self
            .docs
            .lock()
            .map_err(|_| ConsoleError::Storage("registration collection lock poisoned".into()))?;

        let mut next = docs.clone();
        change(&mut next)?;

        if let Some(path) = &self.path {
            let list: Vec<&Registration> = next.values().collect();
            saving::save_json(&list, path)
                .map_err(|e| ConsoleError::Storage(format!("{}: {}", path.display(), e)))?;
        }

        *docs = next;
        self.feed.send_replace(ordered(&docs));
        Ok(())
    }
}

fn ordered(docs: &HashMap<String, Registration>) -> Snapshot {
    let mut list: Vec<Registration> = docs.values().cloned().collect();
    list.sort_by(|a, b| {
        b.server_timestamp
            .cmp(&a.server_timestamp)
            .then_with(|| a.id.cmp(&b.id))
    });
    Arc::new(list)
}

impl RegistrationBackend for JsonFileBackend {
    fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.feed.subscribe()
    }

    fn create(&self, new: NewRegistration) -> Result<String> {
        let id = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let reg = Registration {
            id: id.clone(),
            name: new.name,
            email: new.email,
            phone: new.phone,
            college: new.college,
            department: new.department,
            members: new.members,
            events: new.events,
            transaction_id: new.transaction_id,
            upi_name: new.upi_name,
            status: RegistrationStatus::PendingVerification,
            registration_date: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            server_timestamp: now,
        };

        self.write(|docs| {
            docs.insert(id.clone(), reg);
            Ok(())
        })?;
        log::info!("Created registration {}", id);
        Ok(id)
    }

    fn update_status(&self, id: &str, status: RegistrationStatus) -> Result<()> {
        self.write(|docs| {
            let reg = docs
                .get_mut(id)
                .ok_or_else(|| ConsoleError::NotFound(id.to_string()))?;
            reg.status = status;
            Ok(())
        })
    }

    fn update_members(&self, id: &str, members: Vec<TeamMember>) -> Result<()> {
        self.write(|docs| {
            let reg = docs
                .get_mut(id)
                .ok_or_else(|| ConsoleError::NotFound(id.to_string()))?;
            reg.members = Some(members);
            Ok(())
        })
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.write(|docs| {
            docs.remove(id)
                .map(|_| ())
                .ok_or_else(|| ConsoleError::NotFound(id.to_string()))
        })?;
        log::info!("Deleted registration {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(name: &str) -> NewRegistration {
        NewRegistration {
            name: name.to_string(),
            transaction_id: format!("TX-{}", name),
            events: vec!["Quiz".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn create_assigns_pending_status_and_publishes() {
        let backend = JsonFileBackend::in_memory();
        let rx = backend.subscribe();
        let id = backend.create(submission("Ann")).unwrap();

        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, id);
        assert_eq!(snapshot[0].status, RegistrationStatus::PendingVerification);
        assert!(snapshot[0].registration_date.ends_with('Z'));
    }

    #[test]
    fn feed_is_newest_first() {
        let backend = JsonFileBackend::in_memory();
        let first = backend.create(submission("Ann")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = backend.create(submission("Bob")).unwrap();

        let snapshot = backend.subscribe().borrow().clone();
        assert_eq!(snapshot[0].id, second);
        assert_eq!(snapshot[1].id, first);
    }

    #[test]
    fn unknown_id_is_not_found_and_leaves_state() {
        let backend = JsonFileBackend::in_memory();
        backend.create(submission("Ann")).unwrap();

        let err = backend
            .update_status("missing", RegistrationStatus::Verified)
            .unwrap_err();
        assert!(matches!(err, ConsoleError::NotFound(_)));
        assert!(backend.delete("missing").is_err());
        assert_eq!(backend.subscribe().borrow().len(), 1);
    }

    #[test]
    fn file_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registrations.json");

        let id = {
            let backend = JsonFileBackend::open(Some(path.clone())).unwrap();
            let id = backend.create(submission("Ann")).unwrap();
            backend
                .update_status(&id, RegistrationStatus::Verified)
                .unwrap();
            id
        };

        let reopened = JsonFileBackend::open(Some(path)).unwrap();
        let snapshot = reopened.subscribe().borrow().clone();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, id);
        assert!(snapshot[0].is_verified());
    }
}
