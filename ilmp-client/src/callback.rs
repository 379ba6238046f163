//! Server-addressable callback handlers.

use ilmp_protocol::Tokens;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// A handler the server can push messages to.
///
/// Plain messages arrive as a parameter token list; JSON messages arrive as
/// the raw document. Handlers that only care about one kind can rely on the
/// default `on_json`, which logs and ignores the payload.
///
/// The registry owns the handler once registered and drops it when the
/// server releases its last reference, when it is cancelled, or when the
/// connection closes. Implement `Drop` to clean up resources tied to it.
pub trait Callback: Send {
    fn on_data(&mut self, params: &mut Tokens<'_>);

    fn on_json(&mut self, json: &[u8]) {
        tracing::warn!(json = %String::from_utf8_lossy(json), "ignoring json data");
    }
}

pub(crate) type SharedCallback = Arc<Mutex<dyn Callback>>;

pub(crate) fn share<C: Callback + 'static>(callback: C) -> SharedCallback {
    Arc::new(Mutex::new(callback))
}

/// Function-style handler; JSON payloads are ignored.
pub struct FnCallback<F> {
    func: F,
}

impl<F> Callback for FnCallback<F>
where
    F: FnMut(&mut Tokens<'_>) + Send,
{
    fn on_data(&mut self, params: &mut Tokens<'_>) {
        (self.func)(params)
    }
}

/// Wraps a closure receiving plain message parameters.
pub fn from_fn<F>(func: F) -> FnCallback<F>
where
    F: FnMut(&mut Tokens<'_>) + Send,
{
    FnCallback { func }
}

/// JSON handler; plain messages are ignored.
pub struct JsonCallback<F> {
    func: F,
}

impl<F> Callback for JsonCallback<F>
where
    F: FnMut(Value) + Send,
{
    fn on_data(&mut self, params: &mut Tokens<'_>) {
        tracing::warn!(
            params = params.count(),
            "ignoring plain data sent to json callback"
        );
    }

    fn on_json(&mut self, json: &[u8]) {
        match serde_json::from_slice(json) {
            Ok(value) => (self.func)(value),
            Err(e) => tracing::warn!(error = %e, "dropping unparseable json data"),
        }
    }
}

/// Wraps a closure receiving parsed JSON messages.
pub fn from_json_fn<F>(func: F) -> JsonCallback<F>
where
    F: FnMut(Value) + Send,
{
    JsonCallback { func }
}
