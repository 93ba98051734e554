//! Shared filesystem watcher with per-stream fan-out.
//!
//! One OS watcher per watched project root, registered on every directory
//! that contains at least one Swift file. Streams subscribe through a
//! bounded channel; delivery is non-blocking per subscriber, so a full
//! channel drops the event for that subscriber only. Dropped events are
//! safe: the subscriber rebuilds from a fresh file snapshot on the next
//! event.
//!
//! The watcher never owns its subscribers. The hub holds weak references,
//! subscriptions hold strong ones, and the OS watcher closes when the
//! last subscription for a root is dropped.

use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use walkdir::WalkDir;

const SUBSCRIBER_CAPACITY: usize = 8;

type ListenerMap = Arc<Mutex<HashMap<u64, mpsc::Sender<PathBuf>>>>;

/// Lends out one [`SharedWatcher`] per project root.
#[derive(Debug, Default)]
pub struct WatcherHub {
    watchers: Mutex<HashMap<PathBuf, Weak<SharedWatcher>>>,
}

impl WatcherHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to Swift file changes under `root`, starting a watcher
    /// if no live one exists for that root.
    ///
    /// # Errors
    ///
    /// Propagates `notify` registration failures.
    pub fn subscribe(&self, root: &Path) -> notify::Result<WatchSubscription> {
        let shared = {
            let mut watchers = self.watchers.lock().expect("watcher hub poisoned");
            match watchers.get(root).and_then(Weak::upgrade) {
                Some(shared) => shared,
                None => {
                    let shared = SharedWatcher::start(root)?;
                    watchers.insert(root.to_path_buf(), Arc::downgrade(&shared));
                    shared
                }
            }
        };
        Ok(shared.subscribe())
    }
}

/// The watcher for one project root.
pub struct SharedWatcher {
    _watcher: Mutex<RecommendedWatcher>,
    listeners: ListenerMap,
    next_id: AtomicU64,
}

impl std::fmt::Debug for SharedWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedWatcher").finish_non_exhaustive()
    }
}

impl SharedWatcher {
    fn start(root: &Path) -> notify::Result<Arc<Self>> {
        let listeners: ListenerMap = Arc::new(Mutex::new(HashMap::new()));

        let callback_listeners = listeners.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| {
                let Ok(event) = res else { return };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                for path in &event.paths {
                    if path.extension().is_some_and(|ext| ext == "swift") {
                        dispatch(&callback_listeners, path);
                    }
                }
            })?;

        let dirs = swift_dirs(root);
        debug!(root = %root.display(), dirs = dirs.len(), "watching Swift directories");
        for dir in &dirs {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }
        if dirs.is_empty() {
            // Nothing to register yet; watch the root itself so newly
            // created Swift files still surface.
            watcher.watch(root, RecursiveMode::Recursive)?;
        }

        Ok(Arc::new(Self {
            _watcher: Mutex::new(watcher),
            listeners,
            next_id: AtomicU64::new(0),
        }))
    }

    fn subscribe(self: &Arc<Self>) -> WatchSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("listener map poisoned")
            .insert(id, tx);
        WatchSubscription { id, rx, shared: self.clone() }
    }
}

/// Non-blocking fan-out: a full subscriber channel drops the event for
/// that subscriber only.
fn dispatch(listeners: &ListenerMap, path: &Path) {
    let listeners = listeners.lock().expect("listener map poisoned");
    for (id, tx) in listeners.iter() {
        if tx.try_send(path.to_path_buf()).is_err() {
            trace!(id = *id, path = %path.display(), "subscriber full, dropping event");
        }
    }
}

/// Directories under `root` containing at least one Swift file, skipping
/// hidden trees.
fn swift_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs = BTreeSet::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with('.'))
    });
    for entry in walker.filter_map(std::result::Result::ok) {
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == "swift")
        {
            if let Some(parent) = entry.path().parent() {
                dirs.insert(parent.to_path_buf());
            }
        }
    }
    dirs.into_iter().collect()
}

/// A stream's subscription; unregisters itself on drop, and drops the OS
/// watcher with the last subscription for its root.
#[derive(Debug)]
pub struct WatchSubscription {
    id: u64,
    rx: mpsc::Receiver<PathBuf>,
    shared: Arc<SharedWatcher>,
}

impl WatchSubscription {
    /// Next changed `.swift` path.
    pub async fn recv(&mut self) -> Option<PathBuf> {
        self.rx.recv().await
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.shared
            .listeners
            .lock()
            .expect("listener map poisoned")
            .remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
    };

    use tokio::sync::mpsc;

    use super::{ListenerMap, dispatch, swift_dirs};

    fn listeners(senders: Vec<mpsc::Sender<PathBuf>>) -> ListenerMap {
        let map: HashMap<u64, mpsc::Sender<PathBuf>> = senders
            .into_iter()
            .enumerate()
            .map(|(id, tx)| (id as u64, tx))
            .collect();
        Arc::new(Mutex::new(map))
    }

    #[tokio::test]
    async fn dispatch_fans_out_to_every_subscriber() {
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let map = listeners(vec![tx_a, tx_b]);

        dispatch(&map, Path::new("/p/V.swift"));
        assert_eq!(rx_a.recv().await.unwrap(), PathBuf::from("/p/V.swift"));
        assert_eq!(rx_b.recv().await.unwrap(), PathBuf::from("/p/V.swift"));
    }

    #[tokio::test]
    async fn full_subscribers_drop_events_without_blocking() {
        let (tx_full, mut rx_full) = mpsc::channel(1);
        let (tx_ok, mut rx_ok) = mpsc::channel(4);
        let map = listeners(vec![tx_full, tx_ok]);

        dispatch(&map, Path::new("/p/a.swift"));
        dispatch(&map, Path::new("/p/b.swift"));
        dispatch(&map, Path::new("/p/c.swift"));

        // The slow subscriber kept only the first event.
        assert_eq!(rx_full.recv().await.unwrap(), PathBuf::from("/p/a.swift"));
        assert!(rx_full.try_recv().is_err());

        // The healthy subscriber saw all three.
        for expected in ["/p/a.swift", "/p/b.swift", "/p/c.swift"] {
            assert_eq!(rx_ok.recv().await.unwrap(), PathBuf::from(expected));
        }
    }

    #[test]
    fn swift_dirs_finds_only_directories_with_swift_files() {
        let root = std::env::temp_dir().join(format!("axe-watch-test-{}", std::process::id()));
        let sources = root.join("Sources");
        let nested = sources.join("Views");
        let empty = root.join("Assets");
        let hidden = root.join(".build");
        for dir in [&sources, &nested, &empty, &hidden] {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(sources.join("App.swift"), "struct App {}").unwrap();
        std::fs::write(nested.join("View.swift"), "struct V {}").unwrap();
        std::fs::write(empty.join("readme.md"), "not swift").unwrap();
        std::fs::write(hidden.join("Gen.swift"), "ignored").unwrap();

        let dirs = swift_dirs(&root);
        assert!(dirs.contains(&sources));
        assert!(dirs.contains(&nested));
        assert!(!dirs.contains(&empty));
        assert!(!dirs.iter().any(|d| d.starts_with(&hidden)));

        let _ = std::fs::remove_dir_all(&root);
    }
}
