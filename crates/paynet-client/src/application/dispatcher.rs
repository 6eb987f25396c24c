//! Routes inbound frames to handlers.
//!
//! Resolution order for a frame of type `T`:
//!
//! 1. the client's subscription for `T`, if any;
//! 2. the default handler registered with `T`'s schema;
//! 3. otherwise the frame is dropped and reported as
//!    [`ClientError::UnregisteredType`].
//!
//! A subscription still needs a registered schema, because the payload is
//! decoded through the registry before any handler sees it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use paynet_core::{Frame, MessageType};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::application::handler::{panic_to_error, ErrorReporter, HandlerContext, SubscriptionTable};
use crate::application::outbox::Outbox;
use crate::application::registry::Registry;
use crate::domain::error::ClientError;

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// No schema or no handler; the frame was dropped.
    Unregistered,
    /// The payload did not decode, or the handler failed or panicked.
    Failed,
}

/// Sequential frame router shared by all sessions of one client.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    subscriptions: Arc<SubscriptionTable>,
    reporter: ErrorReporter,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        subscriptions: Arc<SubscriptionTable>,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            registry,
            subscriptions,
            reporter,
        }
    }

    /// Decodes `frame` and runs its handler to completion.
    ///
    /// Never fails: every problem is reported and the outcome returned, so the
    /// caller's loop keeps going.
    pub async fn dispatch(
        &self,
        frame: Frame,
        outbox: &Outbox,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let message_type = frame.message_type;
        let Ok(meta) = self.registry.lookup(message_type) else {
            self.reporter
                .report(&ClientError::UnregisteredType(message_type));
            return DispatchOutcome::Unregistered;
        };
        let Some(handler) = self
            .subscriptions
            .get(message_type)
            .or_else(|| meta.handler().cloned())
        else {
            self.reporter
                .report(&ClientError::UnregisteredType(message_type));
            return DispatchOutcome::Unregistered;
        };

        let dispatch_error = |source: anyhow::Error| ClientError::Dispatch {
            message_type,
            name: meta.name.clone(),
            source,
        };

        let msg = match meta.decode(&frame.payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.reporter.report(&dispatch_error(e.into()));
                return DispatchOutcome::Failed;
            }
        };
        debug!(%message_type, name = %meta.name, "dispatching");

        let ctx = HandlerContext::new(
            outbox.clone(),
            cancel.clone(),
            message_type,
            Arc::from(meta.name.as_str()),
            self.reporter.clone(),
        );
        match AssertUnwindSafe(handler.handle(ctx, msg)).catch_unwind().await {
            Ok(Ok(())) => DispatchOutcome::Handled,
            Ok(Err(e)) => {
                self.reporter.report(&dispatch_error(e));
                DispatchOutcome::Failed
            }
            Err(panic) => {
                self.reporter.report(&dispatch_error(panic_to_error(panic)));
                DispatchOutcome::Failed
            }
        }
    }

    /// Whether a frame of `message_type` would reach a handler.
    pub fn has_handler(&self, message_type: MessageType) -> bool {
        self.subscriptions.get(message_type).is_some()
            || self
                .registry
                .lookup(message_type)
                .is_ok_and(|meta| meta.handler().is_some())
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use paynet_core::protocol::paybox::{
        CoinAck, CoinCommand, CoinState, TYPE_COIN_ACK, TYPE_COIN_COMMAND, TYPE_PONG,
    };
    use paynet_core::Message;
    use tokio::sync::mpsc;

    use super::*;
    use crate::application::handler::handler_fn;
    use crate::application::outbox::FrameWriter;
    use crate::application::registry::MessageMeta;

    struct ChannelWriter(mpsc::UnboundedSender<Frame>);

    #[async_trait]
    impl FrameWriter for ChannelWriter {
        async fn write_frame(&self, frame: Frame) -> Result<(), ClientError> {
            self.0.send(frame).map_err(|_| ClientError::ConnectionClosed)
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        subscriptions: Arc<SubscriptionTable>,
        outbox: Outbox,
        written: mpsc::UnboundedReceiver<Frame>,
        errors: Arc<Mutex<Vec<String>>>,
    }

    fn fixture(registry: Registry) -> Fixture {
        let registry = Arc::new(registry);
        let subscriptions = Arc::new(SubscriptionTable::default());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let reporter = ErrorReporter::new(Some(Arc::new(move |e: &ClientError| {
            sink.lock().unwrap().push(e.to_string());
        })));
        let (tx, written) = mpsc::unbounded_channel();
        Fixture {
            dispatcher: Dispatcher::new(Arc::clone(&registry), Arc::clone(&subscriptions), reporter),
            subscriptions,
            outbox: Outbox::new(registry, Arc::new(ChannelWriter(tx))),
            written,
            errors,
        }
    }

    fn coin_registry() -> Registry {
        let mut builder = Registry::builder();
        builder
            .register(MessageMeta::of::<CoinCommand>(TYPE_COIN_COMMAND, "paybox.CoinCommand"))
            .unwrap()
            .register(MessageMeta::of::<CoinAck>(TYPE_COIN_ACK, "paybox.CoinAck"))
            .unwrap();
        builder.build()
    }

    fn command_frame(order_id: u64) -> Frame {
        let cmd = CoinCommand {
            order_id,
            amount: 100,
            coin_count: 1,
        };
        Frame::new(TYPE_COIN_COMMAND, cmd.encode_payload().unwrap())
    }

    #[tokio::test]
    async fn test_subscription_handler_acknowledges_command() {
        // Arrange
        let mut fx = fixture(coin_registry());
        fx.subscriptions.subscribe(
            TYPE_COIN_COMMAND,
            handler_fn(|ctx: HandlerContext, cmd: CoinCommand| async move {
                ctx.send(&CoinAck {
                    order_id: cmd.order_id,
                    state: CoinState::Accepted,
                    progress: 0,
                })
                .await?;
                Ok(())
            }),
        );

        // Act
        let outcome = fx
            .dispatcher
            .dispatch(command_frame(7), &fx.outbox, &CancellationToken::new())
            .await;

        // Assert
        assert_eq!(outcome, DispatchOutcome::Handled);
        let frame = fx.written.recv().await.unwrap();
        assert_eq!(frame.message_type, TYPE_COIN_ACK);
        let ack: CoinAck = paynet_core::decode_payload(&frame.payload).unwrap();
        assert_eq!(ack.order_id, 7);
        assert_eq!(ack.state, CoinState::Accepted);
    }

    #[tokio::test]
    async fn test_subscription_overrides_registry_default() {
        // Arrange
        let (tx, mut rx) = mpsc::unbounded_channel();
        let default_tx = tx.clone();
        let mut builder = Registry::builder();
        builder
            .register(
                MessageMeta::of::<CoinCommand>(TYPE_COIN_COMMAND, "paybox.CoinCommand")
                    .with_handler(handler_fn(move |_ctx, _cmd: CoinCommand| {
                        let tx = default_tx.clone();
                        async move {
                            tx.send("default")?;
                            Ok(())
                        }
                    })),
            )
            .unwrap();
        let fx = fixture(builder.build());
        let cancel = CancellationToken::new();

        // Act – default first, then with an override installed, then removed
        fx.dispatcher.dispatch(command_frame(1), &fx.outbox, &cancel).await;
        fx.subscriptions.subscribe(
            TYPE_COIN_COMMAND,
            handler_fn(move |_ctx, _cmd: CoinCommand| {
                let tx = tx.clone();
                async move {
                    tx.send("override")?;
                    Ok(())
                }
            }),
        );
        fx.dispatcher.dispatch(command_frame(2), &fx.outbox, &cancel).await;
        fx.subscriptions.unsubscribe(TYPE_COIN_COMMAND);
        fx.dispatcher.dispatch(command_frame(3), &fx.outbox, &cancel).await;

        // Assert
        assert_eq!(rx.recv().await, Some("default"));
        assert_eq!(rx.recv().await, Some("override"));
        assert_eq!(rx.recv().await, Some("default"));
    }

    #[tokio::test]
    async fn test_unknown_type_is_dropped_and_reported() {
        let fx = fixture(coin_registry());

        let outcome = fx
            .dispatcher
            .dispatch(
                Frame::new(MessageType(0x99), vec![1, 2, 3]),
                &fx.outbox,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome, DispatchOutcome::Unregistered);
        assert!(fx.errors.lock().unwrap()[0].contains("0x0099"));
    }

    #[tokio::test]
    async fn test_registered_type_without_handler_is_dropped() {
        let fx = fixture(coin_registry());
        let outcome = fx
            .dispatcher
            .dispatch(
                Frame::new(TYPE_COIN_ACK, CoinAck::default().encode_payload().unwrap()),
                &fx.outbox,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::Unregistered);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_do_not_stop_dispatch() {
        // Arrange
        let fx = fixture(coin_registry());
        fx.subscriptions.subscribe(
            TYPE_COIN_COMMAND,
            handler_fn(|_ctx, cmd: CoinCommand| async move {
                match cmd.order_id {
                    1 => anyhow::bail!("hopper empty"),
                    2 => panic!("coin sensor fault"),
                    _ => Ok(()),
                }
            }),
        );
        let cancel = CancellationToken::new();

        // Act
        let first = fx.dispatcher.dispatch(command_frame(1), &fx.outbox, &cancel).await;
        let second = fx.dispatcher.dispatch(command_frame(2), &fx.outbox, &cancel).await;
        let third = fx.dispatcher.dispatch(command_frame(3), &fx.outbox, &cancel).await;

        // Assert
        assert_eq!(first, DispatchOutcome::Failed);
        assert_eq!(second, DispatchOutcome::Failed);
        assert_eq!(third, DispatchOutcome::Handled);
        let errors = fx.errors.lock().unwrap();
        assert!(errors[0].contains("hopper empty"));
        assert!(errors[1].contains("coin sensor fault"));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_reported_as_failure() {
        let fx = fixture(coin_registry());
        fx.subscriptions.subscribe(
            TYPE_COIN_COMMAND,
            handler_fn(|_ctx, _cmd: CoinCommand| async { Ok(()) }),
        );

        let outcome = fx
            .dispatcher
            .dispatch(
                Frame::new(TYPE_COIN_COMMAND, vec![0x01]),
                &fx.outbox,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome, DispatchOutcome::Failed);
        assert_eq!(fx.errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pong_without_schema_is_unregistered() {
        let fx = fixture(coin_registry());
        let outcome = fx
            .dispatcher
            .dispatch(Frame::new(TYPE_PONG, Vec::new()), &fx.outbox, &CancellationToken::new())
            .await;
        assert_eq!(outcome, DispatchOutcome::Unregistered);
    }

    #[test]
    fn test_has_handler_follows_subscriptions_and_defaults() {
        // Arrange
        let mut builder = Registry::builder();
        builder
            .register(
                MessageMeta::of::<CoinCommand>(TYPE_COIN_COMMAND, "paybox.CoinCommand")
                    .with_handler(handler_fn(|_ctx, _cmd: CoinCommand| async { Ok(()) })),
            )
            .unwrap()
            .register(MessageMeta::of::<CoinAck>(TYPE_COIN_ACK, "paybox.CoinAck"))
            .unwrap();
        let fx = fixture(builder.build());

        // Act
        let before = fx.dispatcher.has_handler(TYPE_COIN_ACK);
        fx.subscriptions.subscribe(
            TYPE_COIN_ACK,
            handler_fn(|_ctx, _ack: CoinAck| async { Ok(()) }),
        );

        // Assert
        assert!(fx.dispatcher.has_handler(TYPE_COIN_COMMAND));
        assert!(!before);
        assert!(fx.dispatcher.has_handler(TYPE_COIN_ACK));
        assert!(!fx.dispatcher.has_handler(TYPE_PONG));
    }
}
