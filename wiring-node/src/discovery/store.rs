// Directory store contract
//
// The shape mirrors the etcd v2 keys API: a tree of keys and directories with
// per-node TTL, a global modification index, and a long-poll watch that
// returns the first change at or after a given index.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("watch index {requested} was cleared, oldest retained index is {oldest}")]
    IndexCleared { requested: u64, oldest: u64 },

    #[error("directory store unavailable: {0}")]
    Unavailable(String),

    #[error("directory store protocol error: {0}")]
    Protocol(String),
}

/// What happened to a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreAction {
    Get,
    Set,
    Create,
    Update,
    Delete,
    Expire,
    CompareAndSwap,
    CompareAndDelete,
}

impl StoreAction {
    /// Actions after which the node no longer exists
    pub fn is_removal(self) -> bool {
        matches!(
            self,
            StoreAction::Delete | StoreAction::Expire | StoreAction::CompareAndDelete
        )
    }

    /// Actions that wrote a value
    pub fn is_write(self) -> bool {
        matches!(
            self,
            StoreAction::Set
                | StoreAction::Create
                | StoreAction::Update
                | StoreAction::CompareAndSwap
        )
    }
}

/// One key or directory, with children when fetched recursively
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreNode {
    pub key: String,
    pub value: Option<String>,
    pub dir: bool,
    pub nodes: Vec<StoreNode>,
    pub modified_index: u64,
    pub created_index: u64,
    pub ttl: Option<i64>,
}

impl StoreNode {
    /// Last path segment of the key
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or("")
    }

    pub fn child(&self, name: &str) -> Option<&StoreNode> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Largest modified index in this subtree
    pub fn max_modified_index(&self) -> u64 {
        self.nodes
            .iter()
            .map(StoreNode::max_modified_index)
            .fold(self.modified_index, u64::max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreResponse {
    pub action: StoreAction,
    pub node: StoreNode,
    pub prev_node: Option<StoreNode>,
    /// Store-wide index at response time, when the backend reports one
    pub index: Option<u64>,
}

#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Create or refresh a directory.
    ///
    /// `prev_exist = Some(false)` fails with `AlreadyExists` if present,
    /// `Some(true)` fails with `NotFound` if absent, `None` accepts both.
    async fn put_dir(
        &self,
        path: &str,
        ttl: Option<Duration>,
        prev_exist: Option<bool>,
    ) -> Result<StoreResponse, StoreError>;

    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<StoreResponse, StoreError>;

    async fn get(&self, path: &str, recursive: bool) -> Result<StoreResponse, StoreError>;

    async fn delete(&self, key: &str) -> Result<StoreResponse, StoreError>;

    async fn delete_dir(&self, path: &str, recursive: bool) -> Result<StoreResponse, StoreError>;

    /// Wait for the first change under `path` with modified index `>= from_index`
    async fn watch(
        &self,
        path: &str,
        from_index: u64,
        recursive: bool,
    ) -> Result<StoreResponse, StoreError>;
}

/// Join path segments with single slashes, keeping a leading slash
pub fn join_path(base: &str, segments: &[&str]) -> String {
    let mut path = String::from("/");
    for part in std::iter::once(base).chain(segments.iter().copied()) {
        for piece in part.split('/').filter(|p| !p.is_empty()) {
            if path.len() > 1 {
                path.push('/');
            }
            path.push_str(piece);
        }
    }
    path
}

/// Segments of `key` below `root`, or `None` when `key` is outside it
pub fn relative_segments<'a>(root: &str, key: &'a str) -> Option<Vec<&'a str>> {
    let root = join_path(root, &[]);
    let rest = if root == "/" {
        key
    } else {
        let rest = key.strip_prefix(root.as_str())?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }
        rest
    };
    Some(rest.split('/').filter(|s| !s.is_empty()).collect())
}
