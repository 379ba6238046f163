//! Ping/pong liveness detection.
//!
//! Every ping interval the timer either sends a ping, or, when the pong for
//! the previous ping has not arrived yet, reports a timeout and stops.

use crate::connection::Shared;
use crate::error::Fault;
use std::sync::Arc;
use std::time::Duration;

/// Default interval between pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);

/// What a timer tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    SendPing,
    TimedOut,
}

/// Tracks whether a pong is owed by the server.
#[derive(Debug, Default)]
pub(crate) struct PongTracker {
    pending: bool,
}

impl PongTracker {
    pub(crate) fn tick(&mut self) -> Tick {
        if self.pending {
            Tick::TimedOut
        } else {
            self.pending = true;
            Tick::SendPing
        }
    }

    pub(crate) fn pong(&mut self) {
        self.pending = false;
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending
    }
}

/// Timer loop for one connection attempt.
///
/// Exits without rearming once the connection attempt is gone or its
/// transport is no longer open.
pub(crate) async fn run(shared: Arc<Shared>, epoch: u64, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        match shared.ping_tick(epoch) {
            Some(Tick::SendPing) => {}
            Some(Tick::TimedOut) => {
                shared.raise(epoch, Fault::network("Ping/pong timeout"));
                return;
            }
            None => {
                tracing::debug!(conn = %shared.id(), "keepalive stopped, transport not open");
                return;
            }
        }
    }
}
