//! Callback registry.
//!
//! Callbacks are keyed by (pageview id, callback id). Each entry carries the
//! refcount the server holds on it; the entry is destroyed when that count
//! drops to zero or below, when it is cancelled, or when the registry is
//! cleared on close.
//!
//! Outside the registry a callback is only ever named by a [`CallbackHandle`].
//! Handles carry a generation number, so a handle to a destroyed callback
//! resolves to nothing even if its id were ever registered again.

use crate::callback::SharedCallback;
use ilmp_protocol::RefUpdate;
use std::collections::HashMap;

/// Non-owning reference to a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle {
    pageview_id: i64,
    callback_id: i64,
    generation: u64,
}

impl CallbackHandle {
    pub fn pageview_id(&self) -> i64 {
        self.pageview_id
    }

    pub fn callback_id(&self) -> i64 {
        self.callback_id
    }
}

/// Debug view of one registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackInfo {
    pub pageview_id: i64,
    pub callback_id: i64,
    pub refcount: i64,
}

/// Result of a refcount adjustment.
pub(crate) enum Adjustment {
    /// The callback is still registered with this refcount.
    Retained(i64),
    /// The callback was removed; dropping the value destroys it.
    Destroyed(SharedCallback),
}

struct Entry {
    refcount: i64,
    generation: u64,
    handler: SharedCallback,
}

/// Owns every registered callback of one connection.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    pageviews: HashMap<i64, HashMap<i64, Entry>>,
    /// Last id handed out per pageview. Survives the pageview emptying so ids
    /// are never reused before the registry is cleared.
    last_ids: HashMap<i64, i64>,
    generation: u64,
}

impl CallbackRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under the next free id of `pageview_id`, with
    /// refcount 1. Ids start at 1.
    pub(crate) fn register(&mut self, pageview_id: i64, handler: SharedCallback) -> CallbackHandle {
        let last = self.last_ids.entry(pageview_id).or_insert(0);
        *last += 1;
        let callback_id = *last;

        self.generation += 1;
        let generation = self.generation;
        self.pageviews.entry(pageview_id).or_default().insert(
            callback_id,
            Entry {
                refcount: 1,
                generation,
                handler,
            },
        );

        CallbackHandle {
            pageview_id,
            callback_id,
            generation,
        }
    }

    /// Re-registers an existing callback: its refcount is reset to 1, not
    /// incremented. Returns false if the handle no longer resolves.
    pub(crate) fn rearm(&mut self, handle: CallbackHandle) -> bool {
        match self.entry_mut(handle) {
            Some(entry) => {
                entry.refcount = 1;
                true
            }
            None => false,
        }
    }

    /// Looks up a callback by its wire address.
    pub(crate) fn lookup(&self, pageview_id: i64, callback_id: i64) -> Option<SharedCallback> {
        self.pageviews
            .get(&pageview_id)?
            .get(&callback_id)
            .map(|entry| entry.handler.clone())
    }

    /// Whether the handle still resolves; false once the callback is destroyed.
    pub(crate) fn contains(&self, handle: CallbackHandle) -> bool {
        self.entry(handle).is_some()
    }

    pub(crate) fn has_pageview(&self, pageview_id: i64) -> bool {
        self.pageviews.contains_key(&pageview_id)
    }

    pub(crate) fn refcount(&self, handle: CallbackHandle) -> Option<i64> {
        self.entry(handle).map(|entry| entry.refcount)
    }

    /// Applies a refcount update. At zero or below the callback is removed,
    /// and its pageview too once empty. Returns `None` for unknown ids.
    pub(crate) fn adjust(
        &mut self,
        pageview_id: i64,
        callback_id: i64,
        update: RefUpdate,
    ) -> Option<Adjustment> {
        let callbacks = self.pageviews.get_mut(&pageview_id)?;
        let entry = callbacks.get_mut(&callback_id)?;
        entry.refcount = update.apply(entry.refcount);

        if entry.refcount > 0 {
            return Some(Adjustment::Retained(entry.refcount));
        }

        let entry = callbacks.remove(&callback_id)?;
        if callbacks.is_empty() {
            self.pageviews.remove(&pageview_id);
        }
        Some(Adjustment::Destroyed(entry.handler))
    }

    /// Removes a callback regardless of its refcount.
    pub(crate) fn remove(&mut self, handle: CallbackHandle) -> Option<SharedCallback> {
        self.entry(handle)?;
        let callbacks = self.pageviews.get_mut(&handle.pageview_id)?;
        let entry = callbacks.remove(&handle.callback_id)?;
        if callbacks.is_empty() {
            self.pageviews.remove(&handle.pageview_id);
        }
        Some(entry.handler)
    }

    /// Empties the registry and resets id allocation.
    ///
    /// The handlers are returned so the caller can drop them outside any lock.
    pub(crate) fn clear(&mut self) -> Vec<SharedCallback> {
        self.last_ids.clear();
        self.pageviews
            .drain()
            .flat_map(|(_, callbacks)| callbacks.into_values())
            .map(|entry| entry.handler)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pageviews.values().map(HashMap::len).sum()
    }

    /// Lists every entry, ordered by pageview then callback id.
    pub(crate) fn snapshot(&self) -> Vec<CallbackInfo> {
        let mut infos: Vec<CallbackInfo> = self
            .pageviews
            .iter()
            .flat_map(|(&pageview_id, callbacks)| {
                callbacks.iter().map(move |(&callback_id, entry)| CallbackInfo {
                    pageview_id,
                    callback_id,
                    refcount: entry.refcount,
                })
            })
            .collect();
        infos.sort_by_key(|info| (info.pageview_id, info.callback_id));
        infos
    }

    fn entry(&self, handle: CallbackHandle) -> Option<&Entry> {
        self.pageviews
            .get(&handle.pageview_id)?
            .get(&handle.callback_id)
            .filter(|entry| entry.generation == handle.generation)
    }

    fn entry_mut(&mut self, handle: CallbackHandle) -> Option<&mut Entry> {
        self.pageviews
            .get_mut(&handle.pageview_id)?
            .get_mut(&handle.callback_id)
            .filter(|entry| entry.generation == handle.generation)
    }
}
