//! The application-facing callback surface.
//!
//! A host program implements [`EventHandler`] and hands it to the server.
//! Every method has a default, so an application overrides only what it
//! cares about; a missing handler behaves as accept/continue. Handlers run
//! inline on the server's coordinator — a long-running handler blocks the
//! whole server.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::handshake::Request;
use crate::session::Command;

/// The application's verdict on a valid upgrade request.
///
/// `Reject` and `Redirect` answer with a minimal pre-handshake HTTP
/// response and close the socket; the session never reaches streaming and
/// no disconnect event fires for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectAction {
    /// Complete the handshake and start streaming.
    Accept,
    /// Refuse with an HTTP error status (400/401/403/404).
    Reject(u16),
    /// Send the client elsewhere (301/302/307) with a `Location:` header.
    Redirect(u16, String),
}

/// Server lifecycle and per-session events.
pub trait EventHandler: Send + Sync {
    /// The listener is bound and the server is about to enter its loop.
    fn on_server_start(&self) {}

    /// The server left its loop and closed the listener.
    fn on_server_stop(&self) {}

    /// A server-wide error that prevented an operation (for example a
    /// second `run` on an already-running server).
    fn on_server_error(&self, _message: &str) {}

    /// A socket-level error that prevented the loop from starting, such as
    /// a failed bind or missing certificate.
    fn on_socket_error(&self, _code: i32, _message: &str) {}

    /// A client completed a valid upgrade request. Accept it (the 101
    /// response is then written), refuse it with an HTTP error, or
    /// redirect it elsewhere.
    fn on_client_connect(&self, _session: &SessionHandle, _request: &Request) -> ConnectAction {
        ConnectAction::Accept
    }

    /// An accepted session disconnected.
    fn on_client_disconnect(&self, _session: &SessionHandle) {}

    /// A complete message arrived. Return `false` to disconnect the sender.
    fn on_data_receive(&self, _session: &SessionHandle, _payload: Bytes) -> bool {
        true
    }
}

/// A cheap handle onto one live session, valid for the session's lifetime.
///
/// Sends are queued onto the session's outbound channel and written by the
/// session's own I/O task in call order; a handle whose session has already
/// disconnected silently drops everything.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    ip: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub(crate) fn new(id: u64, ip: String, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { id, ip, commands }
    }

    /// Server-local session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer address (IPv4 dotted quad or bracket-free IPv6).
    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// Queues one final text frame.
    pub fn send_text(&self, payload: impl Into<Bytes>) {
        let _ = self.commands.send(Command::SendText(payload.into()));
    }

    /// Queues one final binary frame.
    pub fn send_binary(&self, payload: impl Into<Bytes>) {
        let _ = self.commands.send(Command::SendBinary(payload.into()));
    }

    /// Asks the session to shut its socket down. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }
}
