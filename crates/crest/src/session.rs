//! Per-connection session: handshake, message reassembly, liveness.
//!
//! One session owns one accepted socket for its whole life. Its pump task
//! walks the connection through the lifecycle
//!
//! ```text
//! new ── REQUEST_PENDING ──(valid request, app accepts)── STREAMING ── CLOSED
//!              │                       │
//!              │ invalid request,      │ close frame, bad frame,
//!              │ app rejects, timeout  │ timeout, app rejects data
//!              ▼                       ▼
//!           400 + CLOSED            CLOSED
//! ```
//!
//! and reports application-level events to the server coordinator over a
//! channel. The coordinator answers the connect decision (accept, reject
//! with an error, or redirect) and queues outbound messages through
//! [`Command`]s.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::{
    codec::{Framed, FramedParts},
    sync::CancellationToken,
};

use crate::{
    Result, WsError,
    codec::{FrameCodec, Role},
    frame::{Frame, OpCode},
    handler::ConnectAction,
    handshake,
    server::Options,
    stream::ServerStream,
};

/// Bound on the number of frames buffered while reassembling one message.
pub const MAX_BUFFER: usize = 8;

/// Outbound work queued onto a session by the coordinator or a
/// [`SessionHandle`](crate::SessionHandle).
#[derive(Debug)]
pub(crate) enum Command {
    SendText(Bytes),
    SendBinary(Bytes),
    Disconnect,
}

/// Events a session pump reports to the coordinator.
pub(crate) enum SessionEvent {
    /// A valid upgrade request arrived; the coordinator decides over `reply`.
    Request {
        id: u64,
        request: handshake::Request,
        reply: oneshot::Sender<ConnectAction>,
    },
    /// A complete (possibly reassembled) message arrived.
    Data { id: u64, payload: Bytes },
    /// The pump exited; the socket is gone.
    Disconnected { id: u64 },
}

/// What a received frame amounts to.
enum Received {
    /// A complete application message.
    Message(Bytes),
    /// A control reply that must go back out (pong).
    Reply(Frame),
    /// Peer asked to close.
    Close,
    /// Nothing visible yet (fragment buffered, pong absorbed).
    Nothing,
}

/// Protocol state of one streaming session.
///
/// The reassembly buffer is non-empty exactly between a non-final data frame
/// and its terminating final frame; the first frame fixes the message opcode
/// and every following frame must be a continuation.
struct ClientSession {
    buffer: VecDeque<Frame>,
    pending_ping: Option<[u8; 16]>,
    pinged_at: Option<Instant>,
}

impl ClientSession {
    fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            pending_ping: None,
            pinged_at: None,
        }
    }

    /// Applies one inbound frame to the session state.
    fn on_frame(&mut self, frame: Frame) -> Result<Received> {
        match frame.opcode() {
            OpCode::Close => Ok(Received::Close),
            OpCode::Ping => Ok(Received::Reply(Frame::pong(frame.into_payload()))),
            OpCode::Pong => {
                // Only a pong carrying the outstanding nonce settles the
                // ping; anything else is ignored.
                if let Some(nonce) = self.pending_ping
                    && frame.payload().as_ref() == nonce
                {
                    self.pending_ping = None;
                    self.pinged_at = None;
                }
                Ok(Received::Nothing)
            }
            OpCode::Text | OpCode::Binary => {
                // RFC 6455 §5.4: messages must not interleave. A new data
                // frame mid-reassembly closes the session rather than
                // silently dropping the partial message.
                if !self.buffer.is_empty() {
                    return Err(WsError::InvalidFragment);
                }
                if frame.is_fin() {
                    return Ok(Received::Message(frame.into_payload()));
                }
                self.buffer.push_back(frame);
                Ok(Received::Nothing)
            }
            OpCode::Continuation => {
                if self.buffer.is_empty() {
                    return Err(WsError::InvalidContinuationFrame);
                }
                if self.buffer.len() >= MAX_BUFFER {
                    return Err(WsError::ReassemblyBufferFull);
                }
                let fin = frame.is_fin();
                self.buffer.push_back(frame);
                if !fin {
                    return Ok(Received::Nothing);
                }

                let total: usize = self.buffer.iter().map(|f| f.payload().len()).sum();
                let mut assembled = BytesMut::with_capacity(total);
                for part in self.buffer.drain(..) {
                    assembled.put(part.into_payload());
                }
                Ok(Received::Message(assembled.freeze()))
            }
        }
    }

    /// Draws a fresh 16-byte nonce, stamps the send time, and returns the
    /// ping frame to transmit. An unanswered earlier ping is superseded.
    fn ping(&mut self) -> Frame {
        let nonce: [u8; 16] = rand::random();
        self.pending_ping = Some(nonce);
        self.pinged_at = Some(Instant::now());
        Frame::ping(Bytes::copy_from_slice(&nonce))
    }

    /// `true` when an outstanding ping has gone unanswered past `timeout`.
    fn ping_timed_out(&self, timeout: Duration) -> bool {
        match (self.pending_ping, self.pinged_at) {
            (Some(_), Some(at)) => at.elapsed() > timeout,
            _ => false,
        }
    }
}

pub(crate) struct SessionParams {
    pub id: u64,
    pub stream: Option<TcpStream>,
    pub tls: Option<TlsAcceptor>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub cancel: CancellationToken,
    pub options: Options,
}

/// Drives one connection from accept to teardown.
///
/// Emits exactly one [`SessionEvent::Disconnected`] on exit, whatever the
/// path taken.
pub(crate) async fn run_session(mut params: SessionParams) {
    let id = params.id;
    let events = params.events.clone();

    if let Some(framed) = handshake_phase(&mut params).await {
        streaming_phase(&mut params, framed).await;
    }

    let _ = events.send(SessionEvent::Disconnected { id });
}

/// REQUEST_PENDING: optional TLS accept, one bounded request read, the app's
/// accept decision, and the 101 response — all under the handshake timeout.
async fn handshake_phase(
    params: &mut SessionParams,
) -> Option<Framed<ServerStream, FrameCodec>> {
    let deadline = params.options.handshake_timeout;
    let cancel = params.cancel.clone();
    tokio::select! {
        _ = cancel.cancelled() => None,
        result = tokio::time::timeout(deadline, establish(params)) => match result {
            Ok(framed) => framed,
            Err(_) => {
                tracing::debug!(id = params.id, "handshake timed out");
                None
            }
        },
    }
}

async fn establish(
    params: &mut SessionParams,
) -> Option<Framed<ServerStream, FrameCodec>> {
    let socket = params.stream.take()?;
    let mut stream: ServerStream = match params.tls.take() {
        Some(acceptor) => match acceptor.accept(socket).await {
            Ok(tls) => tls.into(),
            Err(error) => {
                tracing::debug!(id = params.id, %error, "TLS accept failed");
                return None;
            }
        },
        None => socket.into(),
    };

    // The upgrade request is whatever one read delivers, bounded to the
    // request cap. Browsers send it in a single segment.
    let mut buf = [0u8; handshake::MAX_REQUEST_LENGTH];
    let n = match stream.read(&mut buf).await {
        Ok(0) | Err(_) => return None,
        Ok(n) => n,
    };

    let request = match handshake::parse_request(&buf[..n]) {
        Ok(request) => request,
        Err(error) => {
            tracing::debug!(id = params.id, %error, "rejecting upgrade request");
            refuse(&mut stream, handshake::error_response(400)).await;
            return None;
        }
    };

    let key = request.sec_websocket_key().to_string();
    let body = handshake::body_offset(&buf[..n]);
    let leftover = Bytes::copy_from_slice(&buf[body..n]);

    let (reply_tx, reply_rx) = oneshot::channel();
    let event = SessionEvent::Request {
        id: params.id,
        request,
        reply: reply_tx,
    };
    if params.events.send(event).is_err() {
        return None;
    }

    // A dropped reply counts as a rejection.
    match reply_rx.await.unwrap_or(ConnectAction::Reject(400)) {
        ConnectAction::Accept => {}
        ConnectAction::Reject(code) => {
            refuse(&mut stream, handshake::error_response(code)).await;
            return None;
        }
        ConnectAction::Redirect(code, location) => {
            refuse(&mut stream, handshake::redirect_response(code, &location)).await;
            return None;
        }
    }

    let response = handshake::switching_protocols(&handshake::accept_key(&key));
    if let Err(error) = stream.write_all(response.as_bytes()).await {
        tracing::debug!(id = params.id, %error, "handshake write failed");
        return None;
    }

    let codec = FrameCodec::new(Role::Server, params.options.max_payload_len);
    let mut parts = FramedParts::new::<Frame>(stream, codec);
    parts.read_buf = BytesMut::from(&leftover[..]);
    Some(Framed::from_parts(parts))
}

/// Writes a pre-handshake refusal (error or redirect) and closes.
async fn refuse(stream: &mut ServerStream, response: String) {
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// STREAMING: frames in, commands out, liveness timers, until something
/// closes the session.
async fn streaming_phase(
    params: &mut SessionParams,
    mut framed: Framed<ServerStream, FrameCodec>,
) {
    let id = params.id;
    let events = params.events.clone();
    let commands = &mut params.commands;
    let cancel = params.cancel.clone();
    let mut session = ClientSession::new();

    let mut ping_interval = tokio::time::interval(params.options.ping_interval);
    let mut sweep_interval = tokio::time::interval(params.options.sweep_interval);
    // The first tick of a tokio interval is immediate; pings start one full
    // period after the handshake.
    ping_interval.tick().await;
    sweep_interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            frame = framed.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(error)) => {
                        tracing::debug!(id, %error, "closing session");
                        break;
                    }
                    // Peer closed, possibly mid-frame.
                    None => break,
                };
                match session.on_frame(frame) {
                    Ok(Received::Message(payload)) => {
                        let event = SessionEvent::Data { id, payload };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(Received::Reply(reply)) => {
                        if framed.send(reply).await.is_err() {
                            break;
                        }
                    }
                    Ok(Received::Close) => break,
                    Ok(Received::Nothing) => {}
                    Err(error) => {
                        tracing::debug!(id, %error, "protocol error, closing session");
                        break;
                    }
                }
            }

            command = commands.recv() => {
                match command {
                    Some(Command::SendText(payload)) => {
                        if framed.send(Frame::text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Command::SendBinary(payload)) => {
                        if framed.send(Frame::binary(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Command::Disconnect) | None => break,
                }
            }

            _ = ping_interval.tick() => {
                if framed.send(session.ping()).await.is_err() {
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                if session.ping_timed_out(params.options.ping_timeout) {
                    tracing::debug!(id, "ping unanswered, closing session");
                    break;
                }
            }
        }
    }

    let _ = framed.get_mut().shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(opcode: OpCode, fin: bool, payload: &[u8]) -> Frame {
        Frame::new(fin, opcode, None, payload.to_vec())
    }

    #[test]
    fn test_unfragmented_message_passes_through() {
        let mut session = ClientSession::new();
        match session.on_frame(data(OpCode::Text, true, b"hi")).unwrap() {
            Received::Message(payload) => assert_eq!(payload.as_ref(), b"hi"),
            _ => panic!("expected a message"),
        }
        assert!(session.buffer.is_empty());
    }

    #[test]
    fn test_fragments_reassemble_in_order() {
        let mut session = ClientSession::new();
        assert!(matches!(
            session.on_frame(data(OpCode::Text, false, b"foo")).unwrap(),
            Received::Nothing
        ));
        assert!(matches!(
            session.on_frame(data(OpCode::Continuation, false, b"bar")).unwrap(),
            Received::Nothing
        ));
        match session.on_frame(data(OpCode::Continuation, true, b"baz")).unwrap() {
            Received::Message(payload) => assert_eq!(payload.as_ref(), b"foobarbaz"),
            _ => panic!("expected the assembled message"),
        }
        assert!(session.buffer.is_empty());
    }

    #[test]
    fn test_continuation_without_start_is_an_error() {
        let mut session = ClientSession::new();
        assert!(matches!(
            session.on_frame(data(OpCode::Continuation, true, b"x")),
            Err(WsError::InvalidContinuationFrame)
        ));
    }

    #[test]
    fn test_new_data_frame_mid_reassembly_is_an_error() {
        let mut session = ClientSession::new();
        session.on_frame(data(OpCode::Text, false, b"part")).unwrap();
        assert!(matches!(
            session.on_frame(data(OpCode::Binary, true, b"new")),
            Err(WsError::InvalidFragment)
        ));
    }

    /// One more non-final frame than the buffer holds closes the session
    /// before any final frame could arrive.
    #[test]
    fn test_reassembly_buffer_bound() {
        let mut session = ClientSession::new();
        session.on_frame(data(OpCode::Text, false, b"0")).unwrap();
        for i in 1..MAX_BUFFER {
            let result = session
                .on_frame(data(OpCode::Continuation, false, &[b'0' + i as u8]))
                .unwrap();
            assert!(matches!(result, Received::Nothing));
        }
        assert!(matches!(
            session.on_frame(data(OpCode::Continuation, false, b"x")),
            Err(WsError::ReassemblyBufferFull)
        ));
    }

    #[test]
    fn test_ping_reply_echoes_payload() {
        let mut session = ClientSession::new();
        match session.on_frame(data(OpCode::Ping, true, b"token")).unwrap() {
            Received::Reply(frame) => {
                assert_eq!(frame.opcode(), OpCode::Pong);
                assert_eq!(frame.payload().as_ref(), b"token");
            }
            _ => panic!("expected a pong reply"),
        }
    }

    #[test]
    fn test_pong_must_match_nonce() {
        let mut session = ClientSession::new();
        let ping = session.ping();
        assert!(session.pending_ping.is_some());

        // A mismatched pong leaves the ping outstanding.
        session.on_frame(data(OpCode::Pong, true, b"wrong")).unwrap();
        assert!(session.pending_ping.is_some());

        // The matching pong settles it.
        let nonce = ping.payload().clone();
        session.on_frame(data(OpCode::Pong, true, &nonce)).unwrap();
        assert!(session.pending_ping.is_none());
        assert!(!session.ping_timed_out(Duration::ZERO));
    }

    #[test]
    fn test_unsolicited_pong_is_ignored() {
        let mut session = ClientSession::new();
        assert!(matches!(
            session.on_frame(data(OpCode::Pong, true, b"hello")).unwrap(),
            Received::Nothing
        ));
    }

    #[test]
    fn test_ping_nonce_is_sixteen_bytes_and_fresh() {
        let mut session = ClientSession::new();
        let first = session.ping().payload().clone();
        let second = session.ping().payload().clone();
        assert_eq!(first.len(), 16);
        assert_eq!(second.len(), 16);
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_timeout_elapses() {
        let mut session = ClientSession::new();
        let _ = session.ping();
        assert!(!session.ping_timed_out(Duration::from_secs(4)));

        tokio::time::advance(Duration::from_millis(4100)).await;
        assert!(session.ping_timed_out(Duration::from_secs(4)));
    }
}
