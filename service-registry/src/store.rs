use async_trait::async_trait;

use crate::Error;

/// Width of the counter appended to sequential node names.
pub const SEQUENCE_WIDTH: usize = 10;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Removed when the creating session ends; the name gets a
    /// per-parent increasing suffix.
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::EphemeralSequential)
    }
}

/// Metadata returned by [`CoordinationStore::exists`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    pub version: u64,
    /// Owning session for ephemeral nodes, 0 for persistent ones.
    pub ephemeral_owner: u64,
}

/// Notification delivered on a session's event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The child set of `path` changed. The watch that produced this is gone.
    ChildrenChanged { path: String },
    /// The session ended; its ephemeral nodes have been removed.
    SessionExpired,
}

/// One session against a hierarchical coordination service.
///
/// Watches armed through [`children`](Self::children) are one-shot: each
/// fires at most once and must be re-armed by listing the children again.
/// Notifications arrive on the receiver handed out when the session was
/// opened, independently of the caller's task.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create a node and return its actual path (which differs from `path`
    /// for sequential nodes).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String, Error>;

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>, Error>;

    /// Delete a node. `None` skips the version check.
    async fn delete(&self, path: &str, version: Option<u64>) -> Result<(), Error>;

    /// Child names (not full paths), sorted. `watch` arms a one-shot
    /// children watch on `path` for this session.
    async fn children(&self, path: &str, watch: bool) -> Result<Vec<String>, Error>;

    async fn data(&self, path: &str) -> Result<Vec<u8>, Error>;

    fn session_id(&self) -> u64;
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of an absolute path. The root has no parent.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Reject relative paths, trailing slashes and empty segments.
pub fn validate_path(path: &str) -> Result<(), Error> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Name of the `seq`-th sequential child created from `path`.
pub fn sequential_name(path: &str, seq: u64) -> String {
    format!("{}{:0width$}", path, seq, width = SEQUENCE_WIDTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/service_registry", "n_0000000001"), "/service_registry/n_0000000001");
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/"), None);
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/a/b"), Some("/a"));
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/service_registry").is_ok());
        assert!(validate_path("service_registry").is_err());
        assert!(validate_path("/a/").is_err());
        assert!(validate_path("/a//b").is_err());
    }

    #[test]
    fn test_sequential_name_is_zero_padded() {
        assert_eq!(sequential_name("/r/n_", 7), "/r/n_0000000007");
        // Lexical order matches numeric order
        assert!(sequential_name("/r/n_", 9) < sequential_name("/r/n_", 10));
    }
}
