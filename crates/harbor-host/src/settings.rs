use harbor_core::Settings;
use harbor_storage::SettingsStore;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Publishes immutable settings snapshots and funnels every save through a
/// single background writer.
pub struct SettingsService {
    current: watch::Sender<Arc<Settings>>,
}

impl SettingsService {
    pub fn spawn(store: SettingsStore, initial: Settings) -> (Self, JoinHandle<()>) {
        let (current, rx) = watch::channel(Arc::new(initial));
        let writer = tokio::spawn(persist_loop(store, rx));
        (Self { current }, writer)
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.current.subscribe()
    }

    /// Applies `edit` to a copy of the current snapshot. Returns the new
    /// snapshot when anything changed.
    pub fn update(&self, edit: impl FnOnce(&mut Settings)) -> Option<Arc<Settings>> {
        let mut next = (*self.snapshot()).clone();
        edit(&mut next);
        self.replace(next)
    }

    pub fn replace(&self, next: Settings) -> Option<Arc<Settings>> {
        if *self.snapshot() == next {
            return None;
        }
        let next = Arc::new(next);
        self.current.send_replace(next.clone());
        Some(next)
    }
}

/// Saves whatever snapshot is newest each time the writer wakes up.
/// Intermediate snapshots published while a save is running are skipped.
async fn persist_loop(store: SettingsStore, mut rx: watch::Receiver<Arc<Settings>>) {
    while rx.changed().await.is_ok() {
        let settings = rx.borrow_and_update().clone();
        let store = store.clone();
        let path = store.path().display().to_string();
        let result = tokio::task::spawn_blocking(move || store.save(&settings)).await;
        match result {
            Ok(Ok(())) => debug!(event = "settings_saved", path = %path),
            Ok(Err(err)) => warn!(event = "persistence_error", path = %path, error = %err),
            Err(err) => warn!(event = "persistence_error", path = %path, error = %err),
        }
    }
    info!(event = "settings_writer_stopped");
}
