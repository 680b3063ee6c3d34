//! The server: bind, accept, dispatch, timers.
//!
//! One coordinator loop owns the session registry, the `online` counter,
//! every callback invocation, and the user timer wheel. Socket I/O runs in
//! one spawned pump per connection (see the session module); pumps report
//! events over a channel and the coordinator addresses sessions through
//! their [`SessionHandle`]s, so all shared state stays on a single task.

use std::{
    collections::HashMap,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::{net::TcpListener, sync::mpsc};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::{
    Result, WsError,
    codec::MAX_TOTAL_LENGTH,
    config::Config,
    handler::{ConnectAction, EventHandler, SessionHandle},
    session::{self, SessionEvent, SessionParams},
    tls,
};

/// Protocol tuning knobs with the stock defaults.
///
/// ```rust
/// use std::time::Duration;
/// use crest::Options;
///
/// let options = Options::default().with_ping_interval(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum accepted inbound frame payload in bytes. Outbound frames are
    /// not limited by this.
    pub max_payload_len: usize,
    /// How long a connection may sit without completing its handshake.
    pub handshake_timeout: Duration,
    /// How often an idle handshaken session is pinged.
    pub ping_interval: Duration,
    /// How long an unanswered ping is tolerated.
    pub ping_timeout: Duration,
    /// Cadence of the per-session timeout sweep.
    pub sweep_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload_len: MAX_TOTAL_LENGTH,
            handshake_timeout: Duration::from_millis(4000),
            ping_interval: Duration::from_millis(20000),
            ping_timeout: Duration::from_millis(4000),
            sweep_interval: Duration::from_millis(2000),
        }
    }
}

impl Options {
    pub fn with_max_payload_len(mut self, value: usize) -> Self {
        self.max_payload_len = value;
        self
    }

    pub fn with_handshake_timeout(mut self, value: Duration) -> Self {
        self.handshake_timeout = value;
        self
    }

    pub fn with_ping_interval(mut self, value: Duration) -> Self {
        self.ping_interval = value;
        self
    }

    pub fn with_ping_timeout(mut self, value: Duration) -> Self {
        self.ping_timeout = value;
        self
    }

    pub fn with_sweep_interval(mut self, value: Duration) -> Self {
        self.sweep_interval = value;
        self
    }
}

/// A user-registered timer. Due when a full interval has passed since it
/// last fired; firing resets the reference point to now, so drift is
/// tolerated and there are no catch-up bursts.
struct TimerEntry {
    interval: Duration,
    last_fired: Instant,
    callback: Box<dyn FnMut() + Send>,
}

struct ClientEntry {
    handle: SessionHandle,
    accepted: bool,
}

/// A cloneable view onto a running server, for control and introspection
/// from outside the coordinator (signal handlers, admin commands, tests).
#[derive(Clone)]
pub struct ServerHandle {
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    online: Arc<AtomicUsize>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
    started_at: Arc<Mutex<Option<Instant>>>,
}

impl ServerHandle {
    /// Asks the server to leave its loop. Observed between iterations.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the loop is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of accepted sessions that have not yet disconnected.
    pub fn online(&self) -> usize {
        self.online.load(Ordering::SeqCst)
    }

    /// The bound address, available once the listener is up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("lock poisoned")
    }

    /// Time since the listener came up.
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at
            .lock()
            .expect("lock poisoned")
            .map(|at| at.elapsed())
    }
}

/// The WebSocket server.
///
/// Construct with a [`Config`] and an [`EventHandler`], optionally adjust
/// [`Options`] and register timers, then [`run`](Self::run) it. `run`
/// resolves when [`stop`](Self::stop) (or a [`ServerHandle`]) is called.
pub struct Server {
    config: Config,
    options: Options,
    handler: Arc<dyn EventHandler>,
    timers: Vec<TimerEntry>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    online: Arc<AtomicUsize>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
    started_at: Arc<Mutex<Option<Instant>>>,
}

impl Server {
    pub fn new(config: Config, handler: impl EventHandler + 'static) -> Self {
        Self {
            config,
            options: Options::default(),
            handler: Arc::new(handler),
            timers: Vec::new(),
            cancel: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
            online: Arc::new(AtomicUsize::new(0)),
            local_addr: Arc::new(Mutex::new(None)),
            started_at: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Registers a timer run on the coordinator every `interval`.
    ///
    /// Callbacks execute inline on the loop; keep them short.
    pub fn timer(&mut self, interval: Duration, callback: impl FnMut() + Send + 'static) {
        self.timers.push(TimerEntry {
            interval,
            last_fired: Instant::now(),
            callback: Box::new(callback),
        });
    }

    /// A control handle usable from other tasks.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            cancel: self.cancel.clone(),
            running: self.running.clone(),
            online: self.online.clone(),
            local_addr: self.local_addr.clone(),
            started_at: self.started_at.clone(),
        }
    }

    /// Asks a running server to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Number of accepted sessions that have not yet disconnected.
    pub fn online(&self) -> usize {
        self.online.load(Ordering::SeqCst)
    }

    /// Binds the listener and runs the coordinator loop until stopped.
    ///
    /// A second concurrent `run` fires `on_server_error` and returns
    /// [`WsError::AlreadyRunning`] without touching any state. Bind and TLS
    /// setup failures fire `on_socket_error` and the loop is never entered.
    pub async fn run(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            self.invoke(|h| h.on_server_error("Websocket server is already running"));
            return Err(WsError::AlreadyRunning);
        }
        let result = self.run_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(error) => {
                let code = error.raw_os_error().unwrap_or(-1);
                let message = format!("cannot bind {addr}: {error}");
                tracing::error!(%message, "startup failed");
                self.invoke(|h| h.on_socket_error(code, &message));
                return Err(error.into());
            }
        };

        let tls = match self.tls_acceptor() {
            Ok(tls) => tls,
            Err(error) => {
                let message = format!("TLS setup failed: {error}");
                tracing::error!(%message, "startup failed");
                self.invoke(|h| h.on_socket_error(-1, &message));
                return Err(error);
            }
        };

        *self.local_addr.lock().expect("lock poisoned") = listener.local_addr().ok();
        *self.started_at.lock().expect("lock poisoned") = Some(Instant::now());
        tracing::info!(%addr, tls = tls.is_some(), "websocket server listening");

        let start = Instant::now();
        for timer in &mut self.timers {
            timer.last_fired = start;
        }

        self.invoke(|h| h.on_server_start());

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut clients: HashMap<u64, ClientEntry> = HashMap::new();
        let mut next_id: u64 = 1;
        let cancel = self.cancel.clone();
        // The tick bounds how long the loop sleeps with no traffic, so
        // timers fire promptly even on an idle server.
        let mut tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = next_id;
                        next_id += 1;
                        let ip = peer.ip().to_string();
                        tracing::debug!(id, %ip, "connection accepted");

                        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
                        let handle = SessionHandle::new(id, ip, commands_tx);
                        clients.insert(id, ClientEntry { handle, accepted: false });

                        tokio::spawn(session::run_session(SessionParams {
                            id,
                            stream: Some(stream),
                            tls: tls.clone(),
                            events: events_tx.clone(),
                            commands: commands_rx,
                            cancel: cancel.clone(),
                            options: self.options.clone(),
                        }));
                    }
                    Err(error) => {
                        tracing::error!(%error, "accept error");
                    }
                },

                Some(event) = events_rx.recv() => {
                    self.handle_event(event, &mut clients);
                }

                _ = tick.tick() => {
                    self.run_timers();
                }
            }
        }

        drop(listener);
        for entry in clients.values() {
            entry.handle.disconnect();
        }
        tracing::info!("websocket server stopped");
        self.invoke(|h| h.on_server_stop());
        Ok(())
    }

    fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>> {
        if !self.config.wants_tls() {
            return Ok(None);
        }
        let paths = self
            .config
            .ssl_cert_path
            .as_ref()
            .ok_or_else(|| WsError::Config("TLS enabled but sslCertPath is not set".into()))?;
        tls::acceptor(&paths.crt, &paths.key).map(Some)
    }

    fn handle_event(&self, event: SessionEvent, clients: &mut HashMap<u64, ClientEntry>) {
        match event {
            SessionEvent::Request { id, request, reply } => {
                let Some(entry) = clients.get_mut(&id) else {
                    let _ = reply.send(ConnectAction::Reject(400));
                    return;
                };
                let action =
                    self.invoke_connect(|h| h.on_client_connect(&entry.handle, &request));
                let accepted = action == ConnectAction::Accept;
                if accepted {
                    entry.accepted = true;
                    self.online.fetch_add(1, Ordering::SeqCst);
                }
                tracing::debug!(id, path = request.path(), accepted, "upgrade request");
                let _ = reply.send(action);
            }
            SessionEvent::Data { id, payload } => {
                let Some(entry) = clients.get(&id) else {
                    return;
                };
                if !self.invoke_bool(|h| h.on_data_receive(&entry.handle, payload)) {
                    entry.handle.disconnect();
                }
            }
            SessionEvent::Disconnected { id } => {
                let Some(entry) = clients.remove(&id) else {
                    return;
                };
                tracing::debug!(id, accepted = entry.accepted, "session closed");
                if entry.accepted {
                    self.online.fetch_sub(1, Ordering::SeqCst);
                    self.invoke(|h| h.on_client_disconnect(&entry.handle));
                }
            }
        }
    }

    fn run_timers(&mut self) {
        let now = Instant::now();
        for timer in &mut self.timers {
            if now.duration_since(timer.last_fired) >= timer.interval {
                (timer.callback)();
                timer.last_fired = now;
            }
        }
    }

    /// Handler panics are programmer errors; they are logged and the
    /// session-level effect is as if the handler returned falsy.
    fn invoke(&self, f: impl FnOnce(&dyn EventHandler)) {
        let handler = &*self.handler;
        if std::panic::catch_unwind(AssertUnwindSafe(|| f(handler))).is_err() {
            tracing::error!("event handler panicked");
        }
    }

    fn invoke_bool(&self, f: impl FnOnce(&dyn EventHandler) -> bool) -> bool {
        let handler = &*self.handler;
        std::panic::catch_unwind(AssertUnwindSafe(|| f(handler))).unwrap_or_else(|_| {
            tracing::error!("event handler panicked");
            false
        })
    }

    fn invoke_connect(
        &self,
        f: impl FnOnce(&dyn EventHandler) -> ConnectAction,
    ) -> ConnectAction {
        let handler = &*self.handler;
        std::panic::catch_unwind(AssertUnwindSafe(|| f(handler))).unwrap_or_else(|_| {
            tracing::error!("event handler panicked");
            ConnectAction::Reject(400)
        })
    }
}
