//! The client facade.
//!
//! [`Client::run`] owns the connection lifecycle:
//!
//! ```text
//! loop {
//!     connect ─► handshake ─► Ready ─► serve (dispatch + heartbeat)
//!        │           │                    │
//!        └───────────┴──── retryable error: back off, reconnect
//! }
//! ```
//!
//! [`Client::send`] may be called from any task while the client is
//! [`SessionState::Ready`]; otherwise it fails with
//! [`ClientError::ConnectionClosed`].

use std::io;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use paynet_core::protocol::paybox::TYPE_PONG;
use paynet_core::{Frame, Message, MessageType};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::application::dispatcher::Dispatcher;
use crate::application::handler::{ErrorReporter, Handler, SubscriptionTable};
use crate::application::handshake::{Handshake, Inbound, LoginFlow};
use crate::application::heartbeat::{AckClock, HeartbeatMonitor};
use crate::application::outbox::{FrameWriter, Outbox, SendOptions};
use crate::application::registry::{global, Registry};
use crate::domain::config::ClientConfig;
use crate::domain::error::ClientError;
use crate::domain::state::{ClientEvent, SessionState};
use crate::infrastructure::network::{Connector, Session, SessionOptions};
use crate::infrastructure::tls::TlsConnector;

const EVENT_CAPACITY: usize = 64;

/// Handle to a gateway client.  Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    registry: Arc<Registry>,
    connector: Arc<dyn Connector>,
    subscriptions: Arc<SubscriptionTable>,
    dispatcher: Dispatcher,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<ClientEvent>,
    /// Present only while a session is ready.
    outbox: RwLock<Option<Outbox>>,
    running: AtomicBool,
}

/// Clears the running flag when `run` returns or is dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The keepalive task of one ready session.
struct HeartbeatTask {
    handle: JoinHandle<Option<ClientError>>,
    running: bool,
}

impl HeartbeatTask {
    /// Resolves with the error that ended the heartbeat.  Pends forever once
    /// the task has stopped without one.  Cancel-safe.
    async fn failure(&mut self) -> ClientError {
        if self.running {
            let joined = (&mut self.handle).await;
            self.running = false;
            match joined {
                Ok(Some(err)) => return err,
                Ok(None) => {}
                Err(join) => {
                    error!("heartbeat task failed: {join}");
                    return ClientError::ConnectionClosed;
                }
            }
        }
        std::future::pending().await
    }
}

impl Client {
    /// Creates a client that connects over mutual TLS and uses the
    /// process-wide registry, freezing it.
    ///
    /// # Errors
    ///
    /// [`ClientError::Config`] if the configuration is invalid or the TLS
    /// material cannot be loaded.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let connector = TlsConnector::from_config(&config)?;
        Ok(Self::assemble(config, global::freeze(), Arc::new(connector)))
    }

    /// Like [`Client::new`] with an explicit registry.
    pub fn with_registry(config: ClientConfig, registry: Arc<Registry>) -> Result<Self, ClientError> {
        config.validate()?;
        let connector = TlsConnector::from_config(&config)?;
        Ok(Self::assemble(config, registry, Arc::new(connector)))
    }

    /// Creates a client over a custom transport.
    pub fn with_connector(
        config: ClientConfig,
        registry: Arc<Registry>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self::assemble(config, registry, connector))
    }

    fn assemble(config: ClientConfig, registry: Arc<Registry>, connector: Arc<dyn Connector>) -> Self {
        let subscriptions = Arc::new(SubscriptionTable::default());
        let reporter = ErrorReporter::new(config.on_error.clone());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::clone(&subscriptions), reporter);
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(ClientInner {
                config,
                registry,
                connector,
                subscriptions,
                dispatcher,
                state,
                events,
                outbox: RwLock::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Connects, handshakes, and serves until `cancel` fires or a fatal error
    /// occurs.  Retryable failures reconnect according to the retry policy.
    ///
    /// # Errors
    ///
    /// - [`ClientError::AlreadyRunning`] if another `run` is active.
    /// - [`ClientError::HandshakeRejected`] if the gateway declines the device.
    /// - [`ClientError::RetriesExhausted`] when the retry policy gives up.
    ///
    /// Cancellation is not an error: `run` returns `Ok(())`.
    pub async fn run(&self, cancel: CancellationToken, flow: LoginFlow) -> Result<(), ClientError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(ClientError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.inner.running);

        let result = self.reconnect_loop(&cancel, &flow).await;

        self.set_state(SessionState::Closing);
        self.clear_outbox();
        self.set_state(SessionState::Closed);
        match &result {
            Ok(()) => info!("client stopped"),
            Err(e) => error!(phase = %e.phase(), "client stopped: {e}"),
        }
        result
    }

    async fn reconnect_loop(&self, cancel: &CancellationToken, flow: &LoginFlow) -> Result<(), ClientError> {
        let retry = &self.inner.config.retry;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let (reached_ready, outcome) = self.run_session(cancel, flow, attempt).await;
            let err = match outcome {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if !err.is_retryable() {
                return Err(err);
            }

            if reached_ready {
                attempt = 0;
            }
            attempt += 1;
            if !retry.allows(attempt) {
                return Err(ClientError::RetriesExhausted {
                    attempts: attempt - 1,
                    last: Box::new(err),
                });
            }

            let delay = retry.delay_for_attempt(attempt);
            warn!(attempt, ?delay, "session ended: {err}; reconnecting");
            self.emit(ClientEvent::Reconnecting { attempt, delay });
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connect → handshake → serve cycle.  The flag reports whether the
    /// session reached `Ready`.
    async fn run_session(
        &self,
        cancel: &CancellationToken,
        flow: &LoginFlow,
        attempt: u32,
    ) -> (bool, Result<(), ClientError>) {
        let config = &self.inner.config;
        self.set_state(SessionState::Connecting);
        self.emit(ClientEvent::Connecting { attempt });

        let connect = tokio::time::timeout(config.connect_timeout, self.inner.connector.connect());
        let transport = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (false, Ok(())),
            connected = connect => match connected {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => {
                    self.set_state(SessionState::Disconnected);
                    return (false, Err(e));
                }
                Err(_) => {
                    self.set_state(SessionState::Disconnected);
                    return (false, Err(ClientError::Connect {
                        addr: self.inner.connector.describe(),
                        source: io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("no connection within {:?}", config.connect_timeout),
                        ),
                    }));
                }
            },
        };

        let (session, mut inbound) = Session::open(transport, cancel, SessionOptions::from(config));
        let session = Arc::new(session);
        let session_id = session.id();
        self.emit(ClientEvent::Connected { session_id });
        self.set_state(SessionState::Handshaking);

        let mut handshake = Handshake::new(config.handshake_timeout, config.pending_limit);
        let handshake_result = handshake
            .run(flow, &*session, &mut inbound, session.token())
            .await;
        let outcome = match handshake_result {
            Ok(outcome) => outcome,
            Err(e) => {
                let result = settle(cancel, e);
                self.end_session(&session, &result);
                return (false, result);
            }
        };

        let writer: Arc<dyn FrameWriter> = session.clone();
        let outbox = Outbox::new(Arc::clone(&self.inner.registry), writer);
        *self.inner.outbox.write().unwrap_or_else(PoisonError::into_inner) = Some(outbox.clone());
        self.set_state(SessionState::Ready);
        info!(
            session = %session_id,
            device_id = %outcome.register.device_id,
            "session ready"
        );
        self.emit(ClientEvent::Ready {
            session_id,
            device_id: outcome.register.device_id,
        });

        let served = self
            .serve(&session, &outbox, inbound, outcome.pending, cancel)
            .await;
        let result = match served {
            Ok(()) => Ok(()),
            Err(e) => settle(cancel, e),
        };
        self.clear_outbox();
        self.end_session(&session, &result);
        (true, result)
    }

    /// Dispatch loop of a ready session.  Returns `Ok` only on cancellation.
    ///
    /// Frames are handled one at a time, but every wait (including a running
    /// handler) also watches for cancellation and heartbeat failure.
    async fn serve(
        &self,
        session: &Arc<Session>,
        outbox: &Outbox,
        mut inbound: Inbound,
        pending: Vec<Frame>,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let config = &self.inner.config;
        let acks = AckClock::new();
        let heartbeat_cancel = session.token().child_token();
        let _stop_heartbeat = heartbeat_cancel.clone().drop_guard();
        let monitor = HeartbeatMonitor::new(
            config.heartbeat_interval,
            config.heartbeat_miss_limit,
            Arc::clone(&config.heartbeat_factory),
        );
        let writer: Arc<dyn FrameWriter> = session.clone();
        let mut heartbeat = HeartbeatTask {
            handle: tokio::spawn(monitor.run(writer, acks.clone(), heartbeat_cancel)),
            running: true,
        };

        for frame in pending {
            if let ControlFlow::Break(result) = self
                .route_until_stopped(frame, &acks, outbox, session, &mut heartbeat, cancel)
                .await
            {
                return result;
            }
        }

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                err = heartbeat.failure() => return Err(self.heartbeat_failed(session, err)),
                item = inbound.recv() => match item {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => return Err(e),
                    None => return Err(ClientError::ConnectionClosed),
                },
            };
            if let ControlFlow::Break(result) = self
                .route_until_stopped(frame, &acks, outbox, session, &mut heartbeat, cancel)
                .await
            {
                return result;
            }
        }
    }

    /// Routes one frame, abandoning its handler if the run is cancelled or the
    /// heartbeat declares the session dead first.
    async fn route_until_stopped(
        &self,
        frame: Frame,
        acks: &AckClock,
        outbox: &Outbox,
        session: &Session,
        heartbeat: &mut HeartbeatTask,
        cancel: &CancellationToken,
    ) -> ControlFlow<Result<(), ClientError>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => ControlFlow::Break(Ok(())),
            err = heartbeat.failure() => ControlFlow::Break(Err(self.heartbeat_failed(session, err))),
            _ = self.route(frame, acks, outbox, session.token()) => ControlFlow::Continue(()),
        }
    }

    async fn route(&self, frame: Frame, acks: &AckClock, outbox: &Outbox, token: &CancellationToken) {
        let dispatcher = &self.inner.dispatcher;
        if frame.message_type == TYPE_PONG {
            acks.record();
            if !dispatcher.has_handler(frame.message_type) {
                return;
            }
        }
        dispatcher.dispatch(frame, outbox, token).await;
    }

    fn heartbeat_failed(&self, session: &Session, err: ClientError) -> ClientError {
        if matches!(err, ClientError::HeartbeatTimeout { .. }) {
            self.emit(ClientEvent::HeartbeatTimeout {
                session_id: session.id(),
            });
        }
        err
    }

    fn end_session(&self, session: &Session, result: &Result<(), ClientError>) {
        session.close();
        self.set_state(SessionState::Disconnected);
        let reason = match result {
            Ok(()) => "cancelled".to_string(),
            Err(e) => e.to_string(),
        };
        info!(session = %session.id(), %reason, "session ended");
        self.emit(ClientEvent::Disconnected {
            session_id: session.id(),
            reason,
        });
    }

    // ── Messaging ─────────────────────────────────────────────────────────────

    /// Encodes `msg` and waits until it is written to the current session.
    ///
    /// # Errors
    ///
    /// [`ClientError::ConnectionClosed`] when no session is ready, plus the
    /// errors of [`Outbox::send`].
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        msg: &dyn Message,
        opts: SendOptions,
    ) -> Result<(), ClientError> {
        let outbox = self
            .inner
            .outbox
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ClientError::ConnectionClosed)?;
        outbox.send(cancel, msg, opts).await
    }

    /// Routes `message_type` to `handler` for this client, replacing the
    /// registry default.  Takes effect for the next dispatched frame.
    pub fn subscribe(&self, message_type: MessageType, handler: Arc<dyn Handler>) {
        if self
            .inner
            .subscriptions
            .subscribe(message_type, handler)
            .is_some()
        {
            warn!(%message_type, "replacing existing subscription");
        }
    }

    /// Removes a subscription.  Returns `false` if there was none.
    pub fn unsubscribe(&self, message_type: MessageType) -> bool {
        self.inner.subscriptions.unsubscribe(message_type).is_some()
    }

    // ── Observation ───────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Lifecycle events from now on.  Slow receivers may observe `Lagged`.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    fn set_state(&self, state: SessionState) {
        self.inner.state.send_replace(state);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.inner.events.send(event);
    }

    fn clear_outbox(&self) {
        self.inner
            .outbox
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Normalizes a session error: anything after user cancellation is a clean
/// stop, and a session-token cancellation means the connection went away.
fn settle(cancel: &CancellationToken, err: ClientError) -> Result<(), ClientError> {
    if cancel.is_cancelled() {
        return Ok(());
    }
    match err {
        ClientError::Cancelled => Err(ClientError::ConnectionClosed),
        other => Err(other),
    }
}
