use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::store::{parent_path, sequential_name, validate_path};
use crate::{CoordinationStore, CreateMode, Error, NodeStat, WatchEvent};

struct Node {
    data: Vec<u8>,
    version: u64,
    owner: u64,
    next_seq: u64,
}

impl Node {
    fn new(data: Vec<u8>, owner: u64) -> Self {
        Self {
            data,
            version: 0,
            owner,
            next_seq: 0,
        }
    }
}

struct SessionSlot {
    tx: mpsc::UnboundedSender<WatchEvent>,
    watches: HashSet<String>,
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<u64, SessionSlot>,
    next_session: u64,
}

impl Tree {
    fn children_of(&self, path: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|p| parent_path(p) == Some(path) && p.as_str() != "/")
            .map(|p| {
                let start = if path == "/" { 1 } else { path.len() + 1 };
                p[start..].to_string()
            })
            .collect()
    }

    /// Fire (and consume) every children watch armed on `path`.
    fn fire_children_watches(&mut self, path: &str) {
        for (session_id, slot) in self.sessions.iter_mut() {
            if slot.watches.remove(path) {
                tracing::trace!(session_id, path, "Firing children watch");
                let _ = slot.tx.send(WatchEvent::ChildrenChanged {
                    path: path.to_string(),
                });
            }
        }
    }
}

/// In-process coordination namespace shared by any number of sessions.
///
/// Behaves like a single-server coordination service: ephemeral nodes
/// vanish with their session and children watches are one-shot.
#[derive(Clone)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), 0));
        Self {
            tree: Arc::new(Mutex::new(Tree {
                nodes,
                sessions: HashMap::new(),
                next_session: 1,
            })),
        }
    }

    /// Open a new session. The receiver carries that session's watch
    /// notifications.
    pub fn connect(&self) -> (Arc<MemorySession>, mpsc::UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tree = self.tree.lock();
        let id = tree.next_session;
        tree.next_session += 1;
        tree.sessions.insert(
            id,
            SessionSlot {
                tx,
                watches: HashSet::new(),
            },
        );
        drop(tree);

        tracing::debug!(session_id = id, "Opened in-memory session");
        let session = MemorySession {
            tree: self.tree.clone(),
            id,
            fail_next: AtomicU32::new(0),
        };
        (Arc::new(session), rx)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.tree.lock().sessions.len()
    }
}

pub struct MemorySession {
    tree: Arc<Mutex<Tree>>,
    id: u64,
    fail_next: AtomicU32,
}

impl MemorySession {
    /// Simulate session loss: ephemeral nodes owned by this session are
    /// removed, watchers on their parents are notified and every later
    /// call fails with [`Error::Connection`].
    pub fn expire(&self) {
        let mut tree = self.tree.lock();
        let Some(slot) = tree.sessions.remove(&self.id) else {
            return;
        };

        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == self.id)
            .map(|(path, _)| path.clone())
            .collect();

        let mut parents = HashSet::new();
        for path in &owned {
            tree.nodes.remove(path);
            if let Some(parent) = parent_path(path) {
                parents.insert(parent.to_string());
            }
        }
        for parent in &parents {
            tree.fire_children_watches(parent);
        }

        let _ = slot.tx.send(WatchEvent::SessionExpired);
        tracing::debug!(
            session_id = self.id,
            removed = owned.len(),
            "In-memory session expired"
        );
    }

    /// Make the next `n` calls fail with a connection error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.tree.lock().sessions.contains_key(&self.id)
    }

    fn check_call(&self, tree: &Tree) -> Result<(), Error> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Connection("injected failure".to_string()));
        }
        if !tree.sessions.contains_key(&self.id) {
            return Err(Error::Connection(format!("session {} expired", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for MemorySession {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String, Error> {
        validate_path(path)?;
        let mut tree = self.tree.lock();
        self.check_call(&tree)?;

        let parent = parent_path(path).ok_or_else(|| Error::NodeExists(path.to_string()))?;
        let parent_node = tree
            .nodes
            .get_mut(parent)
            .ok_or_else(|| Error::NoNode(parent.to_string()))?;

        let actual = match mode {
            CreateMode::Persistent => path.to_string(),
            CreateMode::EphemeralSequential => {
                let seq = parent_node.next_seq;
                parent_node.next_seq += 1;
                sequential_name(path, seq)
            }
        };

        if tree.nodes.contains_key(&actual) {
            return Err(Error::NodeExists(actual));
        }

        let owner = if mode.is_ephemeral() { self.id } else { 0 };
        tree.nodes.insert(actual.clone(), Node::new(data.to_vec(), owner));
        tree.fire_children_watches(parent);
        Ok(actual)
    }

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>, Error> {
        validate_path(path)?;
        let tree = self.tree.lock();
        self.check_call(&tree)?;

        Ok(tree.nodes.get(path).map(|node| NodeStat {
            version: node.version,
            ephemeral_owner: node.owner,
        }))
    }

    async fn delete(&self, path: &str, version: Option<u64>) -> Result<(), Error> {
        validate_path(path)?;
        let mut tree = self.tree.lock();
        self.check_call(&tree)?;

        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if let Some(expected) = version {
            if node.version != expected {
                return Err(Error::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        if path == "/" || !tree.children_of(path).is_empty() {
            return Err(Error::NotEmpty(path.to_string()));
        }

        tree.nodes.remove(path);
        if let Some(parent) = parent_path(path) {
            tree.fire_children_watches(parent);
        }
        Ok(())
    }

    async fn children(&self, path: &str, watch: bool) -> Result<Vec<String>, Error> {
        validate_path(path)?;
        let mut tree = self.tree.lock();
        self.check_call(&tree)?;

        if !tree.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        let mut children = tree.children_of(path);
        children.sort();

        if watch {
            if let Some(slot) = tree.sessions.get_mut(&self.id) {
                slot.watches.insert(path.to_string());
            }
        }
        Ok(children)
    }

    async fn data(&self, path: &str) -> Result<Vec<u8>, Error> {
        validate_path(path)?;
        let tree = self.tree.lock();
        self.check_call(&tree)?;

        tree.nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }

    fn session_id(&self) -> u64 {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_persistent_create_conflicts() {
        let store = MemoryStore::new();
        let (session, _rx) = store.connect();

        let path = session.create("/registry", b"", CreateMode::Persistent).await.unwrap();
        assert_eq!(path, "/registry");

        let err = session
            .create("/registry", b"", CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeExists(_)));
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let store = MemoryStore::new();
        let (session, _rx) = store.connect();

        let err = session
            .create("/missing/n_", b"x", CreateMode::EphemeralSequential)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoNode(p) if p == "/missing"));
    }

    #[tokio::test]
    async fn test_sequential_names_increase() {
        let store = MemoryStore::new();
        let (session, _rx) = store.connect();
        session.create("/r", b"", CreateMode::Persistent).await.unwrap();

        let a = session.create("/r/n_", b"a", CreateMode::EphemeralSequential).await.unwrap();
        let b = session.create("/r/n_", b"b", CreateMode::EphemeralSequential).await.unwrap();
        assert_eq!(a, "/r/n_0000000000");
        assert_eq!(b, "/r/n_0000000001");

        // Counter is not reused after a delete
        session.delete(&b, None).await.unwrap();
        let c = session.create("/r/n_", b"c", CreateMode::EphemeralSequential).await.unwrap();
        assert_eq!(c, "/r/n_0000000002");

        let children = session.children("/r", false).await.unwrap();
        assert_eq!(children, vec!["n_0000000000", "n_0000000002"]);
    }

    #[tokio::test]
    async fn test_watch_is_one_shot() {
        let store = MemoryStore::new();
        let (watcher, mut rx) = store.connect();
        let (writer, _wrx) = store.connect();
        writer.create("/r", b"", CreateMode::Persistent).await.unwrap();

        watcher.children("/r", true).await.unwrap();
        writer.create("/r/n_", b"a", CreateMode::EphemeralSequential).await.unwrap();
        writer.create("/r/n_", b"b", CreateMode::EphemeralSequential).await.unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            WatchEvent::ChildrenChanged { path: "/r".into() }
        );
        // Second change was not observed because the watch was not re-armed
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_expire_removes_ephemerals_and_notifies() {
        let store = MemoryStore::new();
        let (watcher, mut watcher_rx) = store.connect();
        let (member, mut member_rx) = store.connect();
        watcher.create("/r", b"", CreateMode::Persistent).await.unwrap();
        let node = member
            .create("/r/n_", b"http://h1:8080", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(
            watcher.exists(&node).await.unwrap().unwrap().ephemeral_owner,
            member.session_id()
        );

        watcher.children("/r", true).await.unwrap();
        member.expire();

        assert!(watcher.exists(&node).await.unwrap().is_none());
        assert!(watcher.exists("/r").await.unwrap().is_some());
        assert_eq!(
            watcher_rx.try_recv().unwrap(),
            WatchEvent::ChildrenChanged { path: "/r".into() }
        );
        assert_eq!(member_rx.try_recv().unwrap(), WatchEvent::SessionExpired);

        let err = member.exists("/r").await.unwrap_err();
        assert!(err.is_connection());
        assert!(!member.is_alive());
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_checks_version_and_children() {
        let store = MemoryStore::new();
        let (session, _rx) = store.connect();
        session.create("/r", b"", CreateMode::Persistent).await.unwrap();
        session.create("/r/n_", b"", CreateMode::EphemeralSequential).await.unwrap();

        assert!(matches!(
            session.delete("/r", None).await.unwrap_err(),
            Error::NotEmpty(_)
        ));
        assert!(matches!(
            session.delete("/r/n_0000000000", Some(3)).await.unwrap_err(),
            Error::BadVersion { expected: 3, actual: 0, .. }
        ));
        session.delete("/r/n_0000000000", Some(0)).await.unwrap();
        assert!(matches!(
            session.delete("/r/n_0000000000", None).await.unwrap_err(),
            Error::NoNode(_)
        ));
    }

    #[tokio::test]
    async fn test_fail_next_injects_connection_errors() {
        let store = MemoryStore::new();
        let (session, _rx) = store.connect();
        session.fail_next(2);

        assert!(session.exists("/").await.unwrap_err().is_connection());
        assert!(session.exists("/").await.unwrap_err().is_connection());
        assert!(session.exists("/").await.unwrap().is_some());
    }
}
