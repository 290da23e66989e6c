//! The queue and transfer engine: a single coordinator (spec §9
//! `CoreContext` design note) wrapping the index state in
//! `tokio::sync::RwLock`s, with submodules implementing each piece of
//! behavior that reads or writes it.
//!
//! Lock discipline (spec §5): readers take `RwLock::read`, the scheduler and
//! mutating control calls take `write`. Anything that would otherwise
//! recurse into a lock from inside a held lock is instead deferred onto the
//! [`background`] task queue.

pub mod autoprio;
pub mod background;
pub mod delayed_events;
pub mod partial_share;
pub mod persistence;
pub mod scheduler;
pub mod search_driver;
pub mod transfer;
pub mod ubn;

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::bundle::{Bundle, PathInfo};
use crate::bundle_queue::BundleQueue;
use crate::collaborators::{
    FileListMatcher, HashStore, NoopFileListMatcher, NoopHashStore, NoopSearchService,
    NoopUdpTransport, SearchService, UdpTransport,
};
use crate::config::EngineConfig;
use crate::download::Download;
use crate::error::{Error, Result};
use crate::file_queue::FileQueue;
use crate::queued_file::QueuedFile;
use crate::types::{BundleToken, ConnectionToken, Event, FileToken, Priority};
use crate::user_queue::UserQueue;

use autoprio::AutoPrioController;
use background::BackgroundTaskQueue;
use delayed_events::DelayedEventCoalescer;
use partial_share::PartialShareHandler;
use persistence::QueuePersistence;
use scheduler::DownloadScheduler;
use search_driver::SearchDriver;
use ubn::UbnPublisher;

/// Collaborator trait objects the engine defers to for anything outside its
/// own index/state (spec §6.6).
pub struct Collaborators {
    pub hash_store: Arc<dyn HashStore>,
    pub search_service: Arc<dyn SearchService>,
    pub udp_transport: Arc<dyn UdpTransport>,
    pub file_list_matcher: Arc<dyn FileListMatcher>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            hash_store: Arc::new(NoopHashStore),
            search_service: Arc::new(NoopSearchService),
            udp_transport: Arc::new(NoopUdpTransport),
            file_list_matcher: Arc::new(NoopFileListMatcher),
        }
    }
}

/// The engine. Cheap to clone via `Arc`; every public method takes `&self`
/// and internally acquires whatever locks it needs.
pub struct QueueEngine {
    pub config: EngineConfig,
    pub files: RwLock<FileQueue>,
    pub bundles: RwLock<BundleQueue>,
    pub users: RwLock<UserQueue>,
    pub downloads: RwLock<std::collections::HashMap<ConnectionToken, Download>>,
    pub collaborators: Collaborators,
    pub events: broadcast::Sender<Event>,
    pub autoprio: AutoPrioController,
    pub persistence: QueuePersistence,
    pub partial_share: PartialShareHandler,
    pub search_driver: SearchDriver,
    pub ubn: UbnPublisher,
    pub scheduler: DownloadScheduler,
    pub delayed_events: Arc<DelayedEventCoalescer>,
    next_file_token: std::sync::atomic::AtomicU32,
    next_bundle_token: std::sync::atomic::AtomicU32,
    clock: fn() -> i64,
}

impl QueueEngine {
    /// Builds an engine with no-op collaborators (tests, headless replay).
    #[must_use]
    pub fn new(config: EngineConfig, clock: fn() -> i64) -> Arc<Self> {
        Self::with_collaborators(config, Collaborators::default(), clock)
    }

    #[must_use]
    pub fn with_collaborators(config: EngineConfig, collaborators: Collaborators, clock: fn() -> i64) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            config,
            files: RwLock::new(FileQueue::new()),
            bundles: RwLock::new(BundleQueue::new()),
            users: RwLock::new(UserQueue::new()),
            downloads: RwLock::new(std::collections::HashMap::new()),
            collaborators,
            events,
            autoprio: AutoPrioController::default(),
            persistence: QueuePersistence::default(),
            partial_share: PartialShareHandler::default(),
            search_driver: SearchDriver::default(),
            ubn: UbnPublisher::default(),
            scheduler: DownloadScheduler::default(),
            delayed_events: Arc::new(DelayedEventCoalescer::default()),
            next_file_token: std::sync::atomic::AtomicU32::new(1),
            next_bundle_token: std::sync::atomic::AtomicU32::new(1),
            clock,
        })
    }

    /// Spawns the background task loop and the periodic tick tasks
    /// (auto-priority, search driver, persistence) described in spec §2/§14.
    /// Returns the task queue handle; dropping `cancel` or cancelling it
    /// stops all of them.
    pub fn spawn_background_tasks(self: &Arc<Self>, cancel: CancellationToken) -> BackgroundTaskQueue {
        background::spawn(Arc::clone(self), cancel)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    /// Creates a bundle and returns its token (spec §4.3 `addBundle`).
    pub async fn add_bundle(&self, local_root: impl Into<String>, priority: Priority) -> BundleToken {
        let token = BundleToken(self.next_bundle_token.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
        let bundle = Bundle::new(token, PathInfo::new(local_root), priority, self.now());
        let mut bundles = self.bundles.write().await;
        // infallible: token is freshly minted, never a duplicate.
        let _ = bundles.add_bundle(bundle);
        drop(bundles);
        self.emit(Event::BundleAdded { bundle: token });
        token
    }

    /// Queues a file under `bundle` (spec §4.2 `add`, §4.3 `addBundleItem`).
    pub async fn add_file(
        &self,
        bundle: BundleToken,
        target: impl Into<String>,
        size: i64,
        tth: impl Into<String>,
        priority: Priority,
    ) -> Result<FileToken> {
        let token = FileToken(self.next_file_token.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
        let mut file = QueuedFile::new(token, target, size, tth, priority, self.now());
        file.bundle = Some(bundle);

        let mut files = self.files.write().await;
        files.add(file)?;
        drop(files);

        let mut bundles = self.bundles.write().await;
        bundles.add_bundle_item(bundle, token)?;
        drop(bundles);

        self.emit(Event::FileAdded { file: token, bundle });
        Ok(token)
    }

    pub async fn remove_bundle(&self, bundle: BundleToken) -> Result<()> {
        let mut bundles = self.bundles.write().await;
        let removed = bundles
            .remove_bundle(bundle)
            .ok_or_else(|| Error::NotFound(format!("bundle {bundle}")))?;
        drop(bundles);

        let mut files = self.files.write().await;
        let mut users = self.users.write().await;
        for file_token in &removed.files {
            if let Some(file) = files.remove(*file_token) {
                for source in &file.sources {
                    users.remove_file(&source.user, *file_token);
                }
            }
        }
        drop(files);
        drop(users);

        self.emit(Event::BundleRemoved { bundle });
        Ok(())
    }

    pub async fn pause_bundle(&self, bundle: BundleToken, force: bool) -> Result<()> {
        self.set_bundle_priority(
            bundle,
            if force { Priority::PausedForce } else { Priority::Paused },
        )
        .await
    }

    pub async fn resume_bundle(&self, bundle: BundleToken) -> Result<()> {
        self.set_bundle_priority(bundle, Priority::Normal).await
    }

    pub async fn set_bundle_priority(&self, bundle: BundleToken, priority: Priority) -> Result<()> {
        let mut bundles = self.bundles.write().await;
        let b = bundles
            .find_bundle_mut(bundle)
            .ok_or_else(|| Error::NotFound(format!("bundle {bundle}")))?;
        b.priority = priority;
        b.auto_priority = false;
        let file_tokens: Vec<FileToken> = b.files.iter().copied().collect();
        drop(bundles);

        let files = self.files.read().await;
        let mut pairs = Vec::new();
        let mut transitions = Vec::new();
        for token in file_tokens {
            if let Some(file) = files.find_file(token) {
                if file.priority != priority {
                    transitions.push((token, file.priority));
                }
                for source in &file.sources {
                    pairs.push((source.user.clone(), token));
                }
            }
        }
        drop(files);

        let mut files = self.files.write().await;
        for (_, token) in &pairs {
            if let Some(f) = files.find_file_mut(*token) {
                f.priority = priority;
            }
        }
        drop(files);

        let mut users = self.users.write().await;
        users.set_bundle_priority(&pairs, priority);
        drop(users);

        for (token, old) in transitions {
            self.autoprio.handle_priority_transition(self, token, old, priority).await;
        }

        self.emit(Event::PriorityChanged { bundle, priority });
        Ok(())
    }

    pub async fn set_file_priority(&self, file: FileToken, priority: Priority) -> Result<()> {
        let mut files = self.files.write().await;
        let f = files
            .find_file_mut(file)
            .ok_or_else(|| Error::NotFound(format!("file {file}")))?;
        let old = f.priority;
        f.priority = priority;
        f.auto_priority = false;
        let sources: Vec<String> = f.sources.iter().map(|s| s.user.clone()).collect();
        drop(files);

        let mut users = self.users.write().await;
        for user in sources {
            users.set_priority(&user, file, priority);
        }
        drop(users);

        if old != priority {
            self.autoprio.handle_priority_transition(self, file, old, priority).await;
        }

        self.emit(Event::FilePriorityChanged { file, priority });
        Ok(())
    }

    /// Registers `user` as a source for `file` (spec §4.2/§4.4 add-source path).
    pub async fn add_source(&self, file: FileToken, user: impl Into<String>, hub_url: impl Into<String>) -> Result<()> {
        let user = user.into();
        let mut files = self.files.write().await;
        let f = files
            .find_file_mut(file)
            .ok_or_else(|| Error::NotFound(format!("file {file}")))?;
        if f.is_source(&user) {
            return Ok(());
        }
        f.sources.push(crate::source::Source::new(user.clone(), hub_url));
        let priority = f.priority;
        drop(files);

        let mut users = self.users.write().await;
        users.add_file(user.clone(), file, priority);
        drop(users);

        self.emit(Event::SourceAdded { file, nick: user });
        Ok(())
    }

    #[must_use]
    pub async fn get_download(&self, connection: ConnectionToken) -> Option<Download> {
        self.downloads.read().await.get(&connection).cloned()
    }
}
