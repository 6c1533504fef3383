use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use tracing::error;

use crate::id::ConnectionId;
use crate::transport::Transport;

/// Per-connection receive callback installed with
/// [`Transport::set_receiver`]. Takes precedence over
/// [`Handler::on_receive`] for that connection.
pub type ReceiveFn = Arc<dyn Fn(ConnectionId, Bytes) + Send + Sync>;

/// Connection event callbacks.
///
/// Hooks run synchronously on the thread that owns the connection's event
/// source: the connection's reader thread for the blocking strategy, the
/// event-loop thread for the selector strategy. Payloads of one connection
/// arrive in order; there is no ordering across connections.
///
/// `link` is the transport that owns the connection, so a hook can reply,
/// close or install a per-connection receiver. Under the selector strategy
/// those calls are queued and take effect after the hook returns.
///
/// Any `Fn(&dyn Transport, ConnectionId, Bytes)` closure is a handler that
/// only cares about payloads.
pub trait Handler: Send + Sync + 'static {
    /// A server accepted a new connection.
    fn on_accept(&self, link: &dyn Transport, id: ConnectionId) {
        let _ = (link, id);
    }

    /// A client finished connecting.
    fn on_connect(&self, link: &dyn Transport, id: ConnectionId) {
        let _ = (link, id);
    }

    /// A complete payload arrived.
    fn on_receive(&self, link: &dyn Transport, id: ConnectionId, payload: Bytes);

    /// The connection was removed: closed locally, by the peer, by a fault
    /// or by `stop`. Fires once per connection; `id` is already gone from
    /// the registry.
    fn on_close(&self, link: &dyn Transport, id: ConnectionId) {
        let _ = (link, id);
    }
}

impl<F> Handler for F
where
    F: Fn(&dyn Transport, ConnectionId, Bytes) + Send + Sync + 'static,
{
    fn on_receive(&self, link: &dyn Transport, id: ConnectionId, payload: Bytes) {
        self(link, id, payload)
    }
}

/// Run a user callback, containing a panic to the callback itself.
pub(crate) fn guarded(hook: &'static str, id: ConnectionId, callback: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
        let message = panic
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        error!(%id, hook, message, "connection callback panicked");
    }
}

/// Deliver one payload to the per-connection receiver, else to the handler.
pub(crate) fn deliver(
    link: &dyn Transport,
    handler: &dyn Handler,
    receiver: Option<&ReceiveFn>,
    id: ConnectionId,
    payload: Bytes,
) {
    guarded("on_receive", id, || match receiver {
        Some(receiver) => receiver(id, payload),
        None => handler.on_receive(link, id, payload),
    });
}
