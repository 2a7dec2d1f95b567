use arc_swap::ArcSwapOption;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::store::join_path;
use crate::{CoordinationStore, CreateMode, Error, WatchEvent};

/// Default parent path for member nodes.
pub const DEFAULT_REGISTRY_ROOT: &str = "/service_registry";

/// Name prefix of member nodes under the registry root.
pub const MEMBER_PREFIX: &str = "n_";

/// Membership change event, derived by diffing consecutive snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Joined(String),
    Left(String),
}

/// Outcome of [`ServiceRegistry::ensure_registry_exists`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryRoot {
    Created,
    AlreadyExists,
}

/// Outcome of [`ServiceRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Registered(String),
    /// A registration was already outstanding; nothing was written.
    AlreadyRegistered(String),
}

/// Outcome of [`ServiceRegistry::unregister`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unregistration {
    Removed(String),
    /// Our node was already gone (e.g. expired with an earlier session blip).
    AlreadyAbsent(String),
    NotRegistered,
}

/// Registers this process under a shared parent node and caches the
/// addresses of every live member.
///
/// The cache is an immutable snapshot swapped in whole by [`refresh`],
/// which is serialized so that the stored list always comes from a
/// single enumeration of the registry root.
///
/// [`refresh`]: ServiceRegistry::refresh
pub struct ServiceRegistry {
    store: Arc<dyn CoordinationStore>,
    root: String,
    current_node: Mutex<Option<String>>,
    addresses: ArcSwapOption<Vec<String>>,
    refresh_lock: Mutex<()>,
    event_tx: broadcast::Sender<MembershipEvent>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self::with_root(store, DEFAULT_REGISTRY_ROOT)
    }

    pub fn with_root(store: Arc<dyn CoordinationStore>, root: &str) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            store,
            root: root.to_string(),
            current_node: Mutex::new(None),
            addresses: ArcSwapOption::empty(),
            refresh_lock: Mutex::new(()),
            event_tx,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Create the persistent registry root unless it is already there.
    ///
    /// Losing a creation race to another process counts as `AlreadyExists`.
    ///
    /// # Errors
    ///
    /// Returns connection or protocol failures. Callers usually log these and
    /// continue, since another process may have created the root.
    pub async fn ensure_registry_exists(&self) -> Result<RegistryRoot, Error> {
        if self.store.exists(&self.root).await?.is_some() {
            tracing::debug!(root = %self.root, "Registry root already exists");
            return Ok(RegistryRoot::AlreadyExists);
        }

        match self.store.create(&self.root, &[], CreateMode::Persistent).await {
            Ok(_) => {
                tracing::info!(root = %self.root, "Created registry root");
                Ok(RegistryRoot::Created)
            }
            Err(Error::NodeExists(_)) => {
                tracing::debug!(root = %self.root, "Registry root created concurrently");
                Ok(RegistryRoot::AlreadyExists)
            }
            Err(e) => Err(e),
        }
    }

    /// Advertise `address` as an ephemeral sequential member node.
    ///
    /// A second call while registered performs no I/O.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be created; local state stays
    /// unregistered in that case.
    pub async fn register(&self, address: &str) -> Result<Registration, Error> {
        let mut current = self.current_node.lock().await;
        if let Some(path) = current.as_ref() {
            tracing::info!(node = %path, "Already registered to service registry");
            return Ok(Registration::AlreadyRegistered(path.clone()));
        }

        let prefix = join_path(&self.root, MEMBER_PREFIX);
        let path = self
            .store
            .create(&prefix, address.as_bytes(), CreateMode::EphemeralSequential)
            .await?;

        tracing::info!(node = %path, address, "Registered to service registry");
        *current = Some(path.clone());
        Ok(Registration::Registered(path))
    }

    /// Remove this process's member node, if any.
    ///
    /// # Errors
    ///
    /// Returns connection or protocol failures. Local state is left
    /// registered so that a later call can retry the delete.
    pub async fn unregister(&self) -> Result<Unregistration, Error> {
        let mut current = self.current_node.lock().await;
        let Some(path) = current.clone() else {
            tracing::debug!("Not registered, nothing to unregister");
            return Ok(Unregistration::NotRegistered);
        };

        let outcome = match self.store.exists(&path).await? {
            Some(_) => match self.store.delete(&path, None).await {
                Ok(()) => Unregistration::Removed(path),
                Err(Error::NoNode(_)) => Unregistration::AlreadyAbsent(path),
                Err(e) => return Err(e),
            },
            None => Unregistration::AlreadyAbsent(path),
        };

        *current = None;
        match &outcome {
            Unregistration::Removed(path) => {
                tracing::info!(node = %path, "Unregistered from service registry")
            }
            Unregistration::AlreadyAbsent(path) => {
                tracing::info!(node = %path, "Registry node already gone, cleared local state")
            }
            Unregistration::NotRegistered => {}
        }
        Ok(outcome)
    }

    /// Arm the children watch and synchronize the cache.
    ///
    /// Safe to call repeatedly; each call re-enumerates the registry root.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial enumeration fails.
    pub async fn subscribe_to_updates(&self) -> Result<Arc<Vec<String>>, Error> {
        self.refresh().await
    }

    /// Cached member addresses, loading them on first use.
    ///
    /// # Errors
    ///
    /// Returns an error only when the cache is empty and the first
    /// enumeration fails.
    pub async fn addresses(&self) -> Result<Arc<Vec<String>>, Error> {
        if let Some(snapshot) = self.addresses.load_full() {
            return Ok(snapshot);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have loaded it while we waited
        if let Some(snapshot) = self.addresses.load_full() {
            return Ok(snapshot);
        }
        self.refresh_locked().await
    }

    /// Cached addresses without any I/O. `None` until the first refresh.
    pub fn cached_addresses(&self) -> Option<Arc<Vec<String>>> {
        self.addresses.load_full()
    }

    /// Re-enumerate the registry root, re-arm the watch and swap in a new
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if listing the root fails. In that case the watch is
    /// not armed and the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<Arc<Vec<String>>, Error> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<Arc<Vec<String>>, Error> {
        // Listing with watch=true is what re-arms the one-shot watch
        let children = self.store.children(&self.root, true).await?;

        let mut addresses = Vec::with_capacity(children.len());
        for child in &children {
            let path = join_path(&self.root, child);
            match self.store.data(&path).await {
                Ok(bytes) => addresses.push(String::from_utf8_lossy(&bytes).into_owned()),
                Err(Error::NoNode(_)) => {
                    tracing::debug!(node = %path, "Member left during refresh, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        let snapshot = Arc::new(addresses);
        let previous = self.addresses.swap(Some(snapshot.clone()));
        tracing::info!(addresses = ?snapshot, "The cluster addresses are");

        self.broadcast_changes(previous.as_deref(), &snapshot);
        Ok(snapshot)
    }

    fn broadcast_changes(&self, previous: Option<&Vec<String>>, current: &[String]) {
        // Counted per address, since two members may advertise the same one
        let mut delta: HashMap<&str, i64> = HashMap::new();
        for address in previous.into_iter().flatten() {
            *delta.entry(address.as_str()).or_default() -= 1;
        }
        for address in current {
            *delta.entry(address.as_str()).or_default() += 1;
        }

        let mut joined = Vec::new();
        let mut left = Vec::new();
        for (address, change) in delta {
            let count = change.unsigned_abs() as usize;
            if change > 0 {
                joined.extend(std::iter::repeat(address).take(count));
            } else {
                left.extend(std::iter::repeat(address).take(count));
            }
        }

        for address in joined {
            tracing::debug!(address, "Member joined");
            let _ = self.event_tx.send(MembershipEvent::Joined(address.to_string()));
        }
        for address in left {
            tracing::debug!(address, "Member left");
            let _ = self.event_tx.send(MembershipEvent::Left(address.to_string()));
        }
    }

    /// Subscribe to membership change events.
    ///
    /// Events are broadcast AFTER the snapshot has been swapped.
    pub fn membership_events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.event_tx.subscribe()
    }

    /// Path of our member node, if registered.
    pub async fn current_node(&self) -> Option<String> {
        self.current_node.lock().await.clone()
    }

    pub async fn is_registered(&self) -> bool {
        self.current_node.lock().await.is_some()
    }

    /// Forget the local registration after the session ended. The
    /// coordination service has already removed the node.
    pub async fn on_session_expired(&self) {
        let mut current = self.current_node.lock().await;
        if let Some(path) = current.take() {
            tracing::warn!(node = %path, "Session expired, registration lost");
        }
    }

    /// Consume watch notifications for this registry's session.
    ///
    /// Every children change on the root triggers a refresh. A failed
    /// refresh leaves the watch disarmed, so it is retried with backoff
    /// until it succeeds or the task is cancelled. Session loss is still
    /// processed while retrying.
    pub fn spawn_watch_task(
        registry: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<WatchEvent>,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Some(WatchEvent::ChildrenChanged { path }) if path == registry.root => {
                        if !registry.refresh_until_armed(&mut events, &cancel_token).await {
                            break;
                        }
                    }
                    Some(WatchEvent::ChildrenChanged { path }) => {
                        tracing::trace!(path = %path, "Ignoring watch on foreign path");
                    }
                    Some(WatchEvent::SessionExpired) => {
                        registry.on_session_expired().await;
                    }
                    None => {
                        tracing::debug!("Watch channel closed");
                        break;
                    }
                }
            }
            tracing::debug!("Watch task shutting down");
        })
    }

    /// Returns false if cancelled, or the session's event channel closed,
    /// before a refresh succeeded.
    async fn refresh_until_armed(
        &self,
        events: &mut mpsc::UnboundedReceiver<WatchEvent>,
        cancel_token: &CancellationToken,
    ) -> bool {
        let mut consecutive_failures: u32 = 0;
        loop {
            let e = match self.refresh().await {
                Ok(_) => return true,
                Err(e) => e,
            };

            consecutive_failures += 1;
            let backoff_ms = 100 * 2u64.pow(consecutive_failures.min(6));
            tracing::error!(
                root = %self.root,
                failures = consecutive_failures,
                backoff_ms,
                "Refresh failed: {}, backing off",
                e
            );

            let backoff = tokio::time::sleep(Duration::from_millis(backoff_ms));
            tokio::pin!(backoff);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => return false,
                    _ = &mut backoff => break,
                    event = events.recv() => match event {
                        Some(WatchEvent::SessionExpired) => self.on_session_expired().await,
                        // The pending retry enumerates the root anyway
                        Some(WatchEvent::ChildrenChanged { .. }) => {}
                        None => return false,
                    },
                }
            }
        }
    }
}
