use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::{RegistrationBackend, Snapshot};
use crate::registration::Registration;

struct FeedState {
    /// Bumped on every attach/detach; a feed task only writes while its
    /// generation is current.
    generation: u64,
    task: Option<JoinHandle<()>>,
}

/// Client-side cache of the registration collection.
///
/// The cache has exactly one writer, the feed task started by
/// [`RegistrationStore::attach`]. Everyone else reads immutable [`Snapshot`]s.
#[derive(Clone)]
pub struct RegistrationStore {
    cache: Arc<watch::Sender<Snapshot>>,
    state: Arc<Mutex<FeedState>>,
}

impl Default for RegistrationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationStore {
    pub fn new() -> Self {
        RegistrationStore {
            cache: Arc::new(watch::channel(Arc::new(Vec::new())).0),
            state: Arc::new(Mutex::new(FeedState {
                generation: 0,
                task: None,
            })),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, FeedState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current contents of the cache.
    pub fn snapshot(&self) -> Snapshot {
        self.cache.borrow().clone()
    }

    /// Receiver notified whenever the feed delivers a new snapshot.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.cache.subscribe()
    }

    pub fn find(&self, id: &str) -> Option<Registration> {
        self.snapshot().iter().find(|r| r.id == id).cloned()
    }

    pub fn is_attached(&self) -> bool {
        self.lock_state().task.is_some()
    }

    /// Start mirroring `backend` into the cache
    ///
    /// Any previous subscription is torn down first, so at most one feed is
    /// ever active. Must be called from within a tokio runtime.
    ///
    /// # Arguments
    /// * `backend` - Collection whose live feed populates the cache
    pub fn attach(&self, backend: Arc<dyn RegistrationBackend>) {
        let mut state = self.lock_state();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.generation += 1;
        let generation = state.generation;

        let mut rx = backend.subscribe();
        let cache = self.cache.clone();
        let shared = self.state.clone();

        state.task = Some(tokio::spawn(async move {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                {
                    let current = match shared.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if current.generation != generation {
                        break;
                    }
                    log::debug!("Feed delivered {} registrations", snapshot.len());
                    cache.send_replace(snapshot);
                }
                if rx.changed().await.is_err() {
                    log::warn!("Registration feed closed by backend");
                    break;
                }
            }
        }));
        log::info!("Registration feed attached");
    }

    /// Stop the feed and empty the cache.
    pub fn detach(&self) {
        let mut state = self.lock_state();
        state.generation += 1;
        if let Some(task) = state.task.take() {
            task.abort();
            log::info!("Registration feed detached");
        }
        self.cache.send_replace(Arc::new(Vec::new()));
    }

    /// Replace the cache contents without a feed.
    #[cfg(test)]
    pub(crate) fn seed(&self, registrations: Vec<Registration>) {
        self.cache.send_replace(Arc::new(registrations));
    }
}
