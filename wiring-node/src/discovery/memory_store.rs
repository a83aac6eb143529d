// In-process directory store
//
// A flat ordered map of absolute keys stands in for the tree. Every mutation
// takes the next global index and is appended to a bounded history that
// watches are served from. TTL expiry is applied lazily whenever the store is
// touched and periodically by waiting watches.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use wiring_common::{log_debug, Component, Logger};

use super::store::{join_path, DirectoryStore, StoreAction, StoreError, StoreNode, StoreResponse};

const DEFAULT_HISTORY_LIMIT: usize = 1000;
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct Entry {
    value: Option<String>,
    dir: bool,
    created_index: u64,
    modified_index: u64,
    expires_at: Option<Instant>,
}

#[derive(Debug, Clone)]
struct StoreEvent {
    action: StoreAction,
    node: StoreNode,
    prev_node: Option<StoreNode>,
}

struct Inner {
    entries: BTreeMap<String, Entry>,
    index: u64,
    history: VecDeque<StoreEvent>,
    /// Smallest index a watch can still be served from
    oldest_retained: u64,
    available: bool,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    changes: watch::Sender<u64>,
    history_limit: usize,
    logger: Arc<Logger>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            "/".to_string(),
            Entry {
                value: None,
                dir: true,
                created_index: 0,
                modified_index: 0,
                expires_at: None,
            },
        );
        let (changes, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                entries,
                index: 0,
                history: VecDeque::new(),
                oldest_retained: 1,
                available: true,
            }),
            changes,
            history_limit: history_limit.max(1),
            logger: Arc::new(Logger::new_root(Component::Store, "memory")),
        }
    }

    pub fn with_logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Current global index
    pub fn index(&self) -> u64 {
        self.inner.lock().index
    }

    /// Drop all retained history; watches from older indexes fail with `IndexCleared`
    pub fn compact(&self) {
        let mut inner = self.inner.lock();
        inner.history.clear();
        inner.oldest_retained = inner.index + 1;
        log_debug!(self.logger, "history compacted at index {}", inner.index);
    }

    /// Simulate the backend going away or coming back
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
        let current = *self.changes.borrow();
        self.changes.send_replace(current);
    }

    /// Value of a plain key, if present and not expired
    pub fn value(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        self.sweep(&mut inner);
        inner
            .entries
            .get(&join_path(key, &[]))
            .and_then(|e| e.value.clone())
    }

    fn check_available(inner: &Inner) -> Result<(), StoreError> {
        if inner.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    fn sweep(&self, inner: &mut Inner) {
        let now = Instant::now();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if !inner.entries.contains_key(&key) {
                continue;
            }
            let prev = Self::view(inner, &key, false);
            Self::remove_subtree(inner, &key);
            log_debug!(self.logger, "expired {key}");
            self.record(inner, StoreAction::Expire, &key, prev);
        }
    }

    fn remove_subtree(inner: &mut Inner, key: &str) {
        let prefix = format!("{key}/");
        let doomed: Vec<String> = inner
            .entries
            .range(key.to_string()..)
            .take_while(|(k, _)| k.as_str() == key || k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed {
            inner.entries.remove(&k);
        }
    }

    fn children_of<'a>(inner: &'a Inner, key: &str) -> Vec<(&'a String, &'a Entry)> {
        let prefix = if key == "/" {
            "/".to_string()
        } else {
            format!("{key}/")
        };
        inner
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| {
                let rest = &k[prefix.len()..];
                !rest.is_empty() && !rest.contains('/')
            })
            .collect()
    }

    fn view(inner: &Inner, key: &str, recursive: bool) -> Option<StoreNode> {
        let entry = inner.entries.get(key)?;
        Some(Self::build_node(inner, key, entry, recursive, true))
    }

    fn build_node(
        inner: &Inner,
        key: &str,
        entry: &Entry,
        recursive: bool,
        top: bool,
    ) -> StoreNode {
        let nodes = if entry.dir && (recursive || top) {
            Self::children_of(inner, key)
                .into_iter()
                .map(|(k, e)| Self::build_node(inner, k, e, recursive, false))
                .collect()
        } else {
            Vec::new()
        };
        let ttl = entry.expires_at.map(|at| {
            at.saturating_duration_since(Instant::now())
                .as_secs()
                .try_into()
                .unwrap_or(i64::MAX)
        });
        StoreNode {
            key: key.to_string(),
            value: entry.value.clone(),
            dir: entry.dir,
            nodes,
            modified_index: entry.modified_index,
            created_index: entry.created_index,
            ttl,
        }
    }

    fn ensure_parents(inner: &mut Inner, key: &str, index: u64) -> Result<(), StoreError> {
        let mut parent = String::new();
        let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
        for segment in segments.iter().take(segments.len().saturating_sub(1)) {
            parent.push('/');
            parent.push_str(segment);
            match inner.entries.get(&parent) {
                Some(entry) if !entry.dir => {
                    return Err(StoreError::Protocol(format!("{parent} is not a directory")))
                }
                Some(_) => {}
                None => {
                    inner.entries.insert(
                        parent.clone(),
                        Entry {
                            value: None,
                            dir: true,
                            created_index: index,
                            modified_index: index,
                            expires_at: None,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Append an event for `key` at a fresh index and wake watchers
    fn record(
        &self,
        inner: &mut Inner,
        action: StoreAction,
        key: &str,
        prev_node: Option<StoreNode>,
    ) -> StoreResponse {
        inner.index += 1;
        let index = inner.index;
        let current = inner.entries.get_mut(key).map(|entry| {
            entry.modified_index = index;
            entry.clone()
        });
        let node = match current {
            Some(entry) => Self::build_node(inner, key, &entry, false, false),
            None => StoreNode {
                key: key.to_string(),
                dir: prev_node.as_ref().is_some_and(|p| p.dir),
                modified_index: index,
                created_index: prev_node.as_ref().map_or(index, |p| p.created_index),
                ..Default::default()
            },
        };
        inner.history.push_back(StoreEvent {
            action,
            node: node.clone(),
            prev_node: prev_node.clone(),
        });
        while inner.history.len() > self.history_limit {
            inner.history.pop_front();
        }
        if let Some(front) = inner.history.front() {
            inner.oldest_retained = front.node.modified_index;
        }
        self.changes.send_replace(index);
        StoreResponse {
            action,
            node,
            prev_node,
            index: Some(index),
        }
    }

    fn expiry(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|ttl| Instant::now() + ttl)
    }

    fn matches(path: &str, key: &str, recursive: bool) -> bool {
        if key == path {
            return true;
        }
        recursive && (path == "/" || key.starts_with(&format!("{path}/")))
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn put_dir(
        &self,
        path: &str,
        ttl: Option<Duration>,
        prev_exist: Option<bool>,
    ) -> Result<StoreResponse, StoreError> {
        let key = join_path(path, &[]);
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        self.sweep(&mut inner);

        let prev = Self::view(&inner, &key, false);
        match (&prev, prev_exist) {
            (Some(p), _) if !p.dir => {
                return Err(StoreError::Protocol(format!("{key} is not a directory")))
            }
            (Some(_), Some(false)) => return Err(StoreError::AlreadyExists(key)),
            (None, Some(true)) => return Err(StoreError::NotFound(key)),
            _ => {}
        }

        let next = inner.index + 1;
        Self::ensure_parents(&mut inner, &key, next)?;
        let action = match prev_exist {
            Some(false) => StoreAction::Create,
            Some(true) => StoreAction::Update,
            None => StoreAction::Set,
        };
        match inner.entries.get_mut(&key) {
            Some(entry) => entry.expires_at = Self::expiry(ttl),
            None => {
                inner.entries.insert(
                    key.clone(),
                    Entry {
                        value: None,
                        dir: true,
                        created_index: next,
                        modified_index: next,
                        expires_at: Self::expiry(ttl),
                    },
                );
            }
        }
        Ok(self.record(&mut inner, action, &key, prev))
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<StoreResponse, StoreError> {
        let key = join_path(key, &[]);
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        self.sweep(&mut inner);

        let prev = Self::view(&inner, &key, false);
        if prev.as_ref().is_some_and(|p| p.dir) {
            return Err(StoreError::Protocol(format!("{key} is a directory")));
        }
        let next = inner.index + 1;
        Self::ensure_parents(&mut inner, &key, next)?;
        let created_index = prev.as_ref().map_or(next, |p| p.created_index);
        inner.entries.insert(
            key.clone(),
            Entry {
                value: Some(value.to_string()),
                dir: false,
                created_index,
                modified_index: next,
                expires_at: Self::expiry(ttl),
            },
        );
        Ok(self.record(&mut inner, StoreAction::Set, &key, prev))
    }

    async fn get(&self, path: &str, recursive: bool) -> Result<StoreResponse, StoreError> {
        let key = join_path(path, &[]);
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        self.sweep(&mut inner);

        let node = Self::view(&inner, &key, recursive).ok_or(StoreError::NotFound(key))?;
        Ok(StoreResponse {
            action: StoreAction::Get,
            node,
            prev_node: None,
            index: Some(inner.index),
        })
    }

    async fn delete(&self, key: &str) -> Result<StoreResponse, StoreError> {
        let key = join_path(key, &[]);
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        self.sweep(&mut inner);

        let prev = Self::view(&inner, &key, false)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if prev.dir {
            return Err(StoreError::Protocol(format!("{key} is a directory")));
        }
        inner.entries.remove(&key);
        Ok(self.record(&mut inner, StoreAction::Delete, &key, Some(prev)))
    }

    async fn delete_dir(&self, path: &str, recursive: bool) -> Result<StoreResponse, StoreError> {
        let key = join_path(path, &[]);
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        self.sweep(&mut inner);

        let prev = Self::view(&inner, &key, false)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if !prev.dir {
            return Err(StoreError::Protocol(format!("{key} is not a directory")));
        }
        if key == "/" {
            return Err(StoreError::Protocol("the root cannot be deleted".to_string()));
        }
        if !recursive && !prev.nodes.is_empty() {
            return Err(StoreError::Protocol(format!("{key} is not empty")));
        }
        Self::remove_subtree(&mut inner, &key);
        Ok(self.record(&mut inner, StoreAction::Delete, &key, Some(prev)))
    }

    async fn watch(
        &self,
        path: &str,
        from_index: u64,
        recursive: bool,
    ) -> Result<StoreResponse, StoreError> {
        let key = join_path(path, &[]);
        let from = if from_index == 0 {
            self.inner.lock().index + 1
        } else {
            from_index
        };

        loop {
            let mut changes = {
                let mut inner = self.inner.lock();
                Self::check_available(&inner)?;
                self.sweep(&mut inner);

                if from < inner.oldest_retained && from <= inner.index {
                    return Err(StoreError::IndexCleared {
                        requested: from,
                        oldest: inner.oldest_retained,
                    });
                }
                let hit = inner.history.iter().find(|event| {
                    event.node.modified_index >= from
                        && Self::matches(&key, &event.node.key, recursive)
                });
                if let Some(event) = hit {
                    return Ok(StoreResponse {
                        action: event.action,
                        node: event.node.clone(),
                        prev_node: event.prev_node.clone(),
                        index: Some(inner.index),
                    });
                }
                let mut rx = self.changes.subscribe();
                rx.borrow_and_update();
                rx
            };
            // Wake on any change, or periodically so TTL expiry is noticed.
            let _ = tokio::time::timeout(SWEEP_INTERVAL, changes.changed()).await;
        }
    }
}
