//! Live change notification for one branch.
//!
//! A [`WatchHub`] maps watcher ids to their subscriptions and an outbound
//! queue. Subscription data is plain (`id → path prefixes`), so whatever
//! carries events to a client only ever sees a [`WatchStream`].
//!
//! Matching: a watcher with no subscriptions sees every path. Otherwise a
//! path matches if any subscription matches it, and a subscription matches
//! if any of its prefixes is a plain string prefix of the path (an empty
//! prefix list matches everything).
//!
//! Queues are unbounded so a slow consumer never blocks the writer. Dropping
//! the stream unregisters the watcher and all of its subscriptions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::paths::matches_prefixes;
use crate::tree;
use crate::types::{Tree, TreePatch, WatchEvent};

struct WatcherEntry {
    subscriptions: HashMap<String, Vec<String>>,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl WatcherEntry {
    fn matches(&self, path: &str) -> bool {
        self.subscriptions.is_empty()
            || self
                .subscriptions
                .values()
                .any(|prefixes| matches_prefixes(path, prefixes))
    }
}

/// Registry of live watchers for one branch.
pub struct WatchHub {
    branch: String,
    watchers: DashMap<String, WatcherEntry>,
    /// subscription id → watcher id
    subscriptions: DashMap<String, String>,
}

impl WatchHub {
    pub fn new(branch: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            branch: branch.into(),
            watchers: DashMap::new(),
            subscriptions: DashMap::new(),
        })
    }

    /// Register a watcher and return its stream.
    ///
    /// Non-empty `path_filters` become a subscription whose id is the
    /// watcher id.
    ///
    /// # Errors
    /// [`Error::WatcherExists`] if `watcher_id` is already live.
    pub(crate) fn register(
        self: &Arc<Self>,
        watcher_id: Option<String>,
        path_filters: Vec<String>,
    ) -> Result<WatchStream> {
        let id = watcher_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (tx, rx) = mpsc::unbounded_channel();

        let mut entry = WatcherEntry {
            subscriptions: HashMap::new(),
            tx,
        };
        if !path_filters.is_empty() {
            if self.subscriptions.contains_key(&id) {
                return Err(Error::invalid_argument(format!(
                    "subscription id already in use: {}",
                    id
                )));
            }
            entry.subscriptions.insert(id.clone(), path_filters);
        }

        match self.watchers.entry(id.clone()) {
            Entry::Occupied(_) => return Err(Error::watcher_exists(id)),
            Entry::Vacant(v) => {
                let has_default = !entry.subscriptions.is_empty();
                v.insert(entry);
                if has_default {
                    self.subscriptions.insert(id.clone(), id.clone());
                }
            }
        }

        tracing::debug!(branch = %self.branch, watcher = %id, "watcher registered");
        Ok(WatchStream {
            id,
            rx,
            hub: Arc::clone(self),
        })
    }

    /// Remove a watcher and all of its subscriptions. Unknown ids are ignored.
    pub(crate) fn unregister(&self, watcher_id: &str) {
        if let Some((_, entry)) = self.watchers.remove(watcher_id) {
            for sub_id in entry.subscriptions.keys() {
                self.subscriptions.remove(sub_id);
            }
            tracing::debug!(branch = %self.branch, watcher = %watcher_id, "watcher unregistered");
        }
    }

    /// Create, update, or remove a subscription of `watcher_id`.
    ///
    /// - `path_filters: Some(..)` creates or replaces the subscription
    ///   (generating an id when `subscription_id` is `None`) and returns its id.
    /// - `path_filters: None` with a `subscription_id` removes it and returns `None`.
    ///
    /// # Errors
    /// [`Error::UnknownWatcher`], [`Error::UnknownSubscription`], or
    /// [`Error::InvalidArgument`] when neither filters nor an id are given or
    /// the id belongs to another watcher.
    pub fn subscribe(
        &self,
        watcher_id: &str,
        path_filters: Option<Vec<String>>,
        subscription_id: Option<String>,
    ) -> Result<Option<String>> {
        let filters = match (path_filters, subscription_id.as_deref()) {
            (Some(filters), _) => filters,
            (None, Some(sub_id)) => {
                self.require_owner(watcher_id, sub_id)?;
                self.unsubscribe(sub_id)?;
                return Ok(None);
            }
            (None, None) => {
                return Err(Error::invalid_argument(
                    "subscribe needs path filters or a subscription id",
                ))
            }
        };

        let sub_id = subscription_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Held across the ownership check and both inserts so `unregister`
        // cannot run in between. Lock order is watchers, then subscriptions.
        let mut watcher = self
            .watchers
            .get_mut(watcher_id)
            .ok_or_else(|| Error::unknown_watcher(watcher_id))?;
        match self.subscriptions.entry(sub_id.clone()) {
            Entry::Occupied(owner) if owner.get() != watcher_id => {
                return Err(Error::invalid_argument(format!(
                    "subscription {} belongs to another watcher",
                    sub_id
                )));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(v) => {
                v.insert(watcher_id.to_string());
            }
        }
        watcher.subscriptions.insert(sub_id.clone(), filters);
        Ok(Some(sub_id))
    }

    /// Remove one subscription; its watcher stays open.
    ///
    /// # Errors
    /// [`Error::UnknownSubscription`] if no live watcher owns `subscription_id`.
    pub fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let (_, watcher_id) = self
            .subscriptions
            .remove(subscription_id)
            .ok_or_else(|| Error::unknown_subscription(subscription_id))?;
        if let Some(mut watcher) = self.watchers.get_mut(&watcher_id) {
            watcher.subscriptions.remove(subscription_id);
        }
        Ok(())
    }

    fn require_owner(&self, watcher_id: &str, subscription_id: &str) -> Result<()> {
        if !self.watchers.contains_key(watcher_id) {
            return Err(Error::unknown_watcher(watcher_id));
        }
        match self.subscriptions.get(subscription_id) {
            Some(owner) if owner.value() == watcher_id => Ok(()),
            Some(_) => Err(Error::invalid_argument(format!(
                "subscription {} belongs to another watcher",
                subscription_id
            ))),
            None => Err(Error::unknown_subscription(subscription_id)),
        }
    }

    /// Deliver one committed patch's events to every matching watcher.
    pub(crate) fn notify(&self, events: &[WatchEvent]) {
        if events.is_empty() {
            return;
        }
        for watcher in self.watchers.iter() {
            for event in events.iter().filter(|e| watcher.matches(&e.path)) {
                if watcher.tx.send(event.clone()).is_err() {
                    // Receiver gone; the stream's drop is unregistering it.
                    tracing::warn!(branch = %self.branch, watcher = %watcher.key(), "dropping event for closed watcher");
                    break;
                }
            }
        }
    }

    /// Queue historical events for one watcher ahead of live delivery.
    ///
    /// Patches are folded from the start of the log to classify each change;
    /// only patches with `timestamp > from_ctime` produce events, and each
    /// path yields at most one event (its earliest change since `from_ctime`).
    pub(crate) fn replay(&self, watcher_id: &str, history: &[TreePatch], from_ctime: i64) -> usize {
        let Some(watcher) = self.watchers.get(watcher_id) else {
            return 0;
        };
        let mut seen = HashSet::new();
        let mut sent = 0;
        let mut prev = Tree::new();
        for patch in history {
            if patch.timestamp > from_ctime {
                for event in tree::patch_events(&prev, patch) {
                    if !watcher.matches(&event.path) || !seen.insert(event.path.clone()) {
                        continue;
                    }
                    if watcher.tx.send(event).is_err() {
                        return sent;
                    }
                    sent += 1;
                }
            }
            tree::apply_patch(&mut prev, patch);
        }
        sent
    }

    /// Drop every watcher. Open streams yield their queued events, then `None`.
    pub(crate) fn close_all(&self) {
        self.watchers.clear();
        self.subscriptions.clear();
    }

    /// Number of live watchers.
    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Subscription ids of a watcher, sorted.
    pub fn subscription_ids(&self, watcher_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .watchers
            .get(watcher_id)
            .map(|w| w.subscriptions.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

/// Live event sequence for one watcher.
///
/// Not restartable: reconnecting means a new `watch` call, optionally with
/// `from_ctime`. Dropping the stream tears the watcher down.
pub struct WatchStream {
    id: String,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
    hub: Arc<WatchHub>,
}

impl WatchStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the next event. Returns `None` once the branch is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Take an already queued event without waiting.
    pub fn try_next(&mut self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain every queued event without waiting.
    pub fn drain(&mut self) -> Vec<WatchEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.try_next() {
            out.push(event);
        }
        out
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.hub.unregister(&self.id);
    }
}

impl std::fmt::Debug for WatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchStream").field("id", &self.id).finish()
    }
}
