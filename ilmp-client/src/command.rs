//! Outbound command builder.

use crate::callback::{from_fn, from_json_fn, share, Callback};
use crate::connection::Connection;
use crate::error::ClientError;
use crate::registry::CallbackHandle;
use ilmp_protocol::{CommandFrame, Tokens};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Argument {
    Int(i64),
    Plain(Vec<u8>),
    Json(Vec<u8>),
    Callback(i64),
}

/// A command being built for one pageview.
///
/// Arguments are appended in order. Callback arguments are registered with
/// the connection as soon as they are appended, so the server can address
/// them from its first reply. [`Command::send`] consumes the builder.
///
/// ```no_run
/// # use ilmp_client::{Connection, ConnectionConfig};
/// # let conn = Connection::new(ConnectionConfig::new("chat.example.com"));
/// let cmd = conn
///     .command("chat.join", 7)
///     .plain("lobby")
///     .func(|params| println!("{:?}", params.try_next_str()));
/// let handle = cmd.last_callback();
/// cmd.send();
/// # let _ = handle;
/// ```
#[must_use = "a command does nothing until it is sent"]
pub struct Command<'a> {
    conn: &'a Connection,
    name: String,
    pageview_id: i64,
    site_dir: Option<String>,
    args: Vec<Argument>,
    last_callback: Option<CallbackHandle>,
}

impl<'a> Command<'a> {
    pub(crate) fn new(conn: &'a Connection, name: &str, pageview_id: i64) -> Self {
        Self {
            conn,
            name: name.to_string(),
            pageview_id,
            site_dir: None,
            args: Vec::new(),
            last_callback: None,
        }
    }

    /// Addresses the command to another site directory than the
    /// connection's default.
    pub fn with_site_dir(mut self, site_dir: impl Into<String>) -> Self {
        self.site_dir = Some(site_dir.into());
        self
    }

    pub fn int(mut self, value: i64) -> Self {
        self.args.push(Argument::Int(value));
        self
    }

    /// Appends a plain string. Any byte is allowed.
    pub fn plain(mut self, value: impl AsRef<[u8]>) -> Self {
        self.args.push(Argument::Plain(value.as_ref().to_vec()));
        self
    }

    /// Appends a literal string, sent as-is to be interpreted as JSON.
    pub fn json(mut self, value: impl AsRef<[u8]>) -> Self {
        self.args.push(Argument::Json(value.as_ref().to_vec()));
        self
    }

    /// Serializes `value` and appends it as a JSON argument.
    pub fn json_value<T>(self, value: &T) -> Result<Self, ClientError>
    where
        T: Serialize + ?Sized,
    {
        let json = serde_json::to_vec(value)?;
        Ok(self.json(json))
    }

    /// Registers `callback` under this command's pageview and appends a
    /// reference to it.
    pub fn callback<C>(mut self, callback: C) -> Self
    where
        C: Callback + 'static,
    {
        let handle = self.conn.register_shared(self.pageview_id, share(callback));
        self.args.push(Argument::Callback(handle.callback_id()));
        self.last_callback = Some(handle);
        self
    }

    /// Appends a function-style callback receiving plain parameters.
    pub fn func<F>(self, func: F) -> Self
    where
        F: FnMut(&mut Tokens<'_>) + Send + 'static,
    {
        self.callback(from_fn(func))
    }

    /// Appends a callback receiving parsed JSON messages.
    pub fn json_func<F>(self, func: F) -> Self
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.callback(from_json_fn(func))
    }

    /// Appends a reference to an already registered callback, resetting its
    /// refcount to 1.
    ///
    /// A handle to a destroyed callback is still written, but the server's
    /// replies to it will be dropped as unknown.
    pub fn rearm(mut self, handle: CallbackHandle) -> Self {
        if !self.conn.rearm(handle) {
            tracing::warn!(
                pageview_id = handle.pageview_id(),
                callback_id = handle.callback_id(),
                "rearming a callback that is no longer registered"
            );
        }
        self.args.push(Argument::Callback(handle.callback_id()));
        self.last_callback = Some(handle);
        self
    }

    /// Handle of the last callback appended so far.
    pub fn last_callback(&self) -> Option<CallbackHandle> {
        self.last_callback
    }

    /// Encodes the command and queues it for writing.
    ///
    /// If the transport is not open the frame is dropped without error;
    /// callbacks registered by the command stay registered.
    pub fn send(self) {
        let site_dir = match &self.site_dir {
            Some(dir) if !dir.is_empty() => dir.as_str(),
            _ => self.conn.config().effective_site_dir(),
        };

        let mut frame = CommandFrame::new(self.pageview_id, site_dir, &self.name);
        for arg in &self.args {
            match arg {
                Argument::Int(value) => frame.int(*value),
                Argument::Plain(value) => frame.plain(value),
                Argument::Json(value) => frame.json(value),
                Argument::Callback(id) => frame.callback(*id),
            };
        }
        self.conn.write(frame.finish());
    }
}
