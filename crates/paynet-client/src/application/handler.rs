//! Message handlers, per-client subscriptions, and the context handed to them.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures_util::FutureExt;
use paynet_core::{Message, MessageType};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::outbox::{Outbox, SendOptions};
use crate::domain::config::ErrorCallback;
use crate::domain::error::ClientError;

/// Reacts to one inbound message.
///
/// Errors are reported through the client's error callback and logged; they
/// never stop dispatching.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext, msg: Box<dyn Message>) -> anyhow::Result<()>;
}

// ── Typed adapter ─────────────────────────────────────────────────────────────

struct TypedHandler<M, F> {
    f: F,
    _schema: PhantomData<fn(M)>,
}

#[async_trait]
impl<M, F, Fut> Handler for TypedHandler<M, F>
where
    M: Message,
    F: Fn(HandlerContext, M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: HandlerContext, msg: Box<dyn Message>) -> anyhow::Result<()> {
        let actual = msg.type_name();
        let msg = msg.downcast::<M>().map_err(|_| {
            anyhow::anyhow!(
                "handler for {} received a {actual}",
                type_name::<M>()
            )
        })?;
        (self.f)(ctx, *msg).await
    }
}

/// Wraps an async closure over a concrete schema type as a [`Handler`].
///
/// ```rust
/// use paynet_client::application::handler::handler_fn;
/// use paynet_core::protocol::paybox::Pong;
///
/// let on_pong = handler_fn(|_ctx, pong: Pong| async move {
///     tracing::debug!(server_time = pong.server_time, "pong");
///     Ok(())
/// });
/// # let _ = on_pong;
/// ```
pub fn handler_fn<M, F, Fut>(f: F) -> Arc<dyn Handler>
where
    M: Message,
    F: Fn(HandlerContext, M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(TypedHandler {
        f,
        _schema: PhantomData,
    })
}

// ── Subscriptions ─────────────────────────────────────────────────────────────

/// Per-client handler overrides keyed by wire type.
#[derive(Default)]
pub struct SubscriptionTable {
    handlers: RwLock<HashMap<MessageType, Arc<dyn Handler>>>,
}

impl SubscriptionTable {
    /// Installs `handler` for `message_type`, returning the one it replaces.
    pub fn subscribe(
        &self,
        message_type: MessageType,
        handler: Arc<dyn Handler>,
    ) -> Option<Arc<dyn Handler>> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_type, handler)
    }

    pub fn unsubscribe(&self, message_type: MessageType) -> Option<Arc<dyn Handler>> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&message_type)
    }

    pub fn get(&self, message_type: MessageType) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message_type)
            .cloned()
    }
}

impl fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut types: Vec<_> = guard.keys().copied().collect();
        types.sort();
        f.debug_struct("SubscriptionTable")
            .field("types", &types)
            .finish()
    }
}

// ── Error reporting ───────────────────────────────────────────────────────────

/// Logs out-of-band errors and forwards them to the configured callback.
#[derive(Clone, Default)]
pub struct ErrorReporter {
    callback: Option<ErrorCallback>,
}

impl ErrorReporter {
    pub fn new(callback: Option<ErrorCallback>) -> Self {
        Self { callback }
    }

    pub fn report(&self, err: &ClientError) {
        warn!(phase = %err.phase(), "{err}");
        if let Some(callback) = &self.callback {
            callback(err);
        }
    }
}

/// Renders a caught panic payload as an error.
pub(crate) fn panic_to_error(payload: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    let text = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    anyhow::anyhow!("handler panicked: {text}")
}

// ── Context ───────────────────────────────────────────────────────────────────

/// What a handler gets besides the message itself.
#[derive(Clone)]
pub struct HandlerContext {
    outbox: Outbox,
    cancel: CancellationToken,
    message_type: MessageType,
    name: Arc<str>,
    reporter: ErrorReporter,
}

impl HandlerContext {
    pub fn new(
        outbox: Outbox,
        cancel: CancellationToken,
        message_type: MessageType,
        name: Arc<str>,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            outbox,
            cancel,
            message_type,
            name,
            reporter,
        }
    }

    /// Sends a message on the session that delivered the one being handled.
    ///
    /// The wire type is inferred from the registry.
    pub async fn send(&self, msg: &dyn Message) -> Result<(), ClientError> {
        self.outbox
            .send(&self.cancel, msg, SendOptions::default())
            .await
    }

    pub async fn send_with(&self, msg: &dyn Message, opts: SendOptions) -> Result<(), ClientError> {
        self.outbox.send(&self.cancel, msg, opts).await
    }

    /// Runs follow-up work after the handler returns.
    ///
    /// The task stops when the session closes.  An error or panic is reported
    /// through the error callback, tagged with this handler's message type.
    pub fn spawn<Fut>(&self, work: Fut) -> JoinHandle<()>
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let reporter = self.reporter.clone();
        let message_type = self.message_type;
        let name = Arc::clone(&self.name);

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(%message_type, "spawned handler work cancelled");
                    return;
                }
                outcome = AssertUnwindSafe(work).catch_unwind() => outcome,
            };
            let source = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e,
                Err(panic) => panic_to_error(panic),
            };
            reporter.report(&ClientError::Dispatch {
                message_type,
                name: name.to_string(),
                source,
            });
        })
    }

    /// Session cancellation token; fires when the session closes.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Registered name of the message being handled.
    pub fn name(&self) -> &str {
        &self.name
    }
}
