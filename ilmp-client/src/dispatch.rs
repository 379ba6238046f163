//! Routing of decoded data frames to registered callbacks.
//!
//! Routing runs under the connection lock and only resolves handlers and
//! applies batch refcount changes. The handlers themselves are invoked
//! afterwards through [`Delivery::deliver`], with the lock released, so they
//! are free to send commands, cancel callbacks or close the connection. The
//! refcount update of a legacy frame is returned as a [`DeferredUpdate`] and
//! applied only after its messages were delivered.

use crate::callback::SharedCallback;
use crate::registry::{Adjustment, CallbackRegistry};
use ilmp_protocol::{BatchEntry, BatchFrame, Frame, LegacyFrame, Message, RefUpdate};

/// A message bound to the handler it is addressed to.
pub(crate) struct Delivery {
    handler: SharedCallback,
    message: Message,
}

impl Delivery {
    pub(crate) fn deliver(self) {
        let mut handler = self.handler.lock();
        match &self.message {
            Message::Json(json) => handler.on_json(json),
            Message::Params(_) => handler.on_data(&mut self.message.params()),
        }
    }
}

/// Outcome of routing one frame.
#[derive(Default)]
pub(crate) struct Routed {
    /// Deliveries in frame order.
    pub(crate) deliveries: Vec<Delivery>,
    /// Callbacks whose refcount hit zero. Dropping them destroys them.
    pub(crate) released: Vec<SharedCallback>,
    /// Legacy refcount update, applied once the deliveries have run.
    pub(crate) deferred: Option<DeferredUpdate>,
}

impl Routed {
    fn adjust(
        &mut self,
        registry: &mut CallbackRegistry,
        pageview_id: i64,
        callback_id: i64,
        update: RefUpdate,
    ) {
        self.released.extend(adjust(registry, pageview_id, callback_id, update));
    }
}

/// A refcount update held back until the frame's messages were delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeferredUpdate {
    pageview_id: i64,
    callback_id: i64,
    update: RefUpdate,
}

impl DeferredUpdate {
    /// Applies the update. Returns the handler if it was destroyed, to be
    /// dropped outside any lock.
    pub(crate) fn apply(self, registry: &mut CallbackRegistry) -> Option<SharedCallback> {
        adjust(registry, self.pageview_id, self.callback_id, self.update)
    }
}

fn adjust(
    registry: &mut CallbackRegistry,
    pageview_id: i64,
    callback_id: i64,
    update: RefUpdate,
) -> Option<SharedCallback> {
    match registry.adjust(pageview_id, callback_id, update) {
        Some(Adjustment::Retained(refcount)) => {
            tracing::trace!(pageview_id, callback_id, refcount, "refcount updated");
            None
        }
        Some(Adjustment::Destroyed(handler)) => {
            tracing::trace!(pageview_id, callback_id, "refcount reached zero");
            Some(handler)
        }
        None => {
            tracing::warn!(
                pageview_id,
                callback_id,
                "ignoring refcount update for unknown callback"
            );
            None
        }
    }
}

/// Routes a data frame. Frames other than legacy and batch frames route to
/// nothing.
pub(crate) fn route(frame: Frame, registry: &mut CallbackRegistry) -> Routed {
    match frame {
        Frame::Legacy(frame) => route_legacy(frame, registry),
        Frame::Batch(frame) => route_batch(frame, registry),
        _ => Routed::default(),
    }
}

fn route_legacy(frame: LegacyFrame, registry: &mut CallbackRegistry) -> Routed {
    let mut routed = Routed::default();
    let LegacyFrame {
        pageview_id,
        callback_id,
        ref_update,
        messages,
        ..
    } = frame;

    let Some(handler) = resolve(registry, pageview_id, callback_id) else {
        return routed;
    };

    routed
        .deliveries
        .extend(messages.into_iter().map(|message| Delivery {
            handler: handler.clone(),
            message,
        }));
    if ref_update != RefUpdate::Keep {
        routed.deferred = Some(DeferredUpdate {
            pageview_id,
            callback_id,
            update: ref_update,
        });
    }
    routed
}

fn route_batch(frame: BatchFrame, registry: &mut CallbackRegistry) -> Routed {
    let mut routed = Routed::default();
    let pageview_id = frame.pageview_id;

    for entry in frame.entries {
        match entry {
            BatchEntry::Deliver {
                callback_id,
                message,
            } => {
                if let Some(handler) = resolve(registry, pageview_id, callback_id) {
                    routed.deliveries.push(Delivery { handler, message });
                }
            }
            BatchEntry::Retain { callback_id } => {
                routed.adjust(registry, pageview_id, callback_id, RefUpdate::Increment);
            }
            BatchEntry::Release { callback_id } => {
                routed.adjust(registry, pageview_id, callback_id, RefUpdate::Decrement);
            }
        }
    }

    routed
}

fn resolve(
    registry: &CallbackRegistry,
    pageview_id: i64,
    callback_id: i64,
) -> Option<SharedCallback> {
    if !registry.has_pageview(pageview_id) {
        tracing::warn!(pageview_id, "ignoring unknown pageview");
        return None;
    }
    let handler = registry.lookup(pageview_id, callback_id);
    if handler.is_none() {
        tracing::warn!(pageview_id, callback_id, "ignoring unknown callback");
    }
    handler
}
