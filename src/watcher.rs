//! Config Watcher (C3): debounced file-change notifications that reload the
//! Stream Store and deliver the fresh `map[id]spec` to registered handlers.
//!
//! Filesystem events come from `notify`, debounced and coalesced so a burst
//! of writes during a save only triggers one reload (see `DESIGN.md`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config as NotifyConfig, Event as NotifyEvent, EventKind, RecommendedWatcher, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::StreamSpec;
use crate::store::StreamStore;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1500);

type ReloadHandler = Box<dyn Fn(BTreeMap<String, StreamSpec>) + Send + Sync>;
type ErrorHandler = Box<dyn Fn(&crate::error::AppError) + Send + Sync>;

pub struct ConfigWatcher {
    store: Arc<StreamStore>,
    path: PathBuf,
    debounce: Duration,
    on_reload: Option<ReloadHandler>,
    on_error: Option<ErrorHandler>,
}

impl ConfigWatcher {
    pub fn new(store: Arc<StreamStore>, path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            path: path.into(),
            debounce: DEFAULT_DEBOUNCE,
            on_reload: None,
            on_error: None,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn on_reload(mut self, handler: impl Fn(BTreeMap<String, StreamSpec>) + Send + Sync + 'static) -> Self {
        self.on_reload = Some(Box::new(handler));
        self
    }

    pub fn on_error(mut self, handler: impl Fn(&crate::error::AppError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(handler));
        self
    }

    /// Run the watch loop until `cancel` fires. `Create`/`Modify` notifications
    /// are treated identically; `Remove`/`Rename` re-arm the watch on the path
    /// so a reinstated file is still observed.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<NotifyEvent>(64);
        let watch_path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<NotifyEvent, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.blocking_send(event);
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| crate::error::AppError::Internal(format!("watcher init failed: {e}")))?;

        arm(&mut watcher, &watch_path);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                maybe_event = rx.recv() => {
                    let Some(event) = maybe_event else { return Ok(()) };
                    if !relevant(&event) {
                        continue;
                    }
                    if matches!(event.kind, EventKind::Remove(_) | EventKind::Modify(notify::event::ModifyKind::Name(_))) {
                        arm(&mut watcher, &watch_path);
                    }
                    self.drain_and_reload(&mut rx, &cancel).await;
                }
            }
        }
    }

    async fn drain_and_reload(&self, rx: &mut mpsc::Receiver<NotifyEvent>, cancel: &CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.debounce) => break,
                maybe = rx.recv() => {
                    if maybe.is_none() {
                        break;
                    }
                }
            }
        }
        self.reload();
    }

    fn reload(&self) {
        match self.store.load() {
            Ok(()) => {
                let all = self.store.get_all();
                if let Some(handler) = &self.on_reload {
                    handler(all);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "config reload failed");
                if let Some(handler) = &self.on_error {
                    handler(&e);
                }
            }
        }
    }
}

fn relevant(event: &NotifyEvent) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn arm(watcher: &mut RecommendedWatcher, path: &Path) {
    let _ = watcher.unwatch(path);
    if let Err(e) = watcher.watch(path, notify::RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, path = %path.display(), "failed to arm config watch");
    }
}
