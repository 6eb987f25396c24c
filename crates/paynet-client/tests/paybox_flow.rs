//! Integration tests for message flow on a ready session.
//!
//! - Inbound frames reach their handlers one at a time, in arrival order.
//! - Frames that arrive during the handshake are replayed once ready.
//! - Concurrent `send` calls never interleave bytes on the wire.
//! - Cancelling `run` does not wait for a busy handler.
//! - The paybox coin scenario: a `CoinCommand` is acknowledged with a
//!   `CoinAck` carrying the CoinAck wire type.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use paynet_client::{
    handler_fn, Client, ClientConfig, ClientError, HandlerContext, SendOptions, SessionState,
};
use paynet_core::decode_payload;
use paynet_core::protocol::paybox::{
    CoinAck, CoinCommand, CoinState, ErrorMsg, LoginReq, LoginRsp, QueryReq, QueryRsp,
    RegisterReq, RegisterRsp, TYPE_COIN_ACK, TYPE_COIN_COMMAND, TYPE_ERROR, TYPE_LOGIN_REQ,
    TYPE_LOGIN_RSP, TYPE_QUERY_REQ, TYPE_QUERY_RSP, TYPE_REGISTER_REQ, TYPE_REGISTER_RSP,
};
use paynet_core::{Message, MessageType};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn spawn_run(client: &Client, cancel: &CancellationToken) -> JoinHandle<Result<(), ClientError>> {
    let client = client.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move { client.run(cancel, common::flow("SN-1", "dev-1", "t")).await })
}

async fn wait_ready(client: &Client) {
    client
        .watch_state()
        .wait_for(|s| *s == SessionState::Ready)
        .await
        .unwrap();
}

/// Subscribes a handler for `M` that reports `label` on `seen`.
fn record<M: Message>(
    client: &Client,
    message_type: MessageType,
    label: &'static str,
    seen: &mpsc::UnboundedSender<&'static str>,
    delay: Duration,
) {
    let seen = seen.clone();
    client.subscribe(
        message_type,
        handler_fn(move |_ctx: HandlerContext, _msg: M| {
            let seen = seen.clone();
            async move {
                tokio::time::sleep(delay).await;
                seen.send(label)?;
                Ok(())
            }
        }),
    );
}

#[tokio::test]
async fn test_frames_are_dispatched_in_arrival_order() {
    // Arrange – the first handler is the slowest
    let (client, _connector, mut gateways) = common::client(common::test_config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    record::<CoinCommand>(&client, TYPE_COIN_COMMAND, "T1", &tx, Duration::from_millis(50));
    record::<QueryRsp>(&client, TYPE_QUERY_RSP, "T2", &tx, Duration::from_millis(10));
    record::<ErrorMsg>(&client, TYPE_ERROR, "T3", &tx, Duration::ZERO);
    let cancel = CancellationToken::new();
    let run = spawn_run(&client, &cancel);
    let mut gateway = gateways.recv().await.unwrap();
    gateway.accept_handshake("dev-1").await;
    wait_ready(&client).await;

    // Act
    gateway.send(TYPE_COIN_COMMAND, &CoinCommand::default()).await;
    gateway.send(TYPE_QUERY_RSP, &QueryRsp::default()).await;
    gateway.send(TYPE_ERROR, &ErrorMsg::default()).await;
    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(rx.recv().await.unwrap());
    }

    // Assert
    assert_eq!(order, vec!["T1", "T2", "T3"]);
    cancel.cancel();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_frames_received_during_handshake_are_replayed_after_ready() {
    // Arrange
    let (client, _connector, mut gateways) = common::client(common::test_config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    record::<CoinCommand>(&client, TYPE_COIN_COMMAND, "early", &tx, Duration::ZERO);
    let cancel = CancellationToken::new();
    let run = spawn_run(&client, &cancel);
    let mut gateway = gateways.recv().await.unwrap();

    // Act – a coin command overtakes the register response
    let _: RegisterReq = gateway.expect(TYPE_REGISTER_REQ).await;
    gateway.send(TYPE_COIN_COMMAND, &CoinCommand::default()).await;
    gateway
        .send(
            TYPE_REGISTER_RSP,
            &RegisterRsp {
                success: true,
                device_id: "dev-1".to_string(),
                message: String::new(),
            },
        )
        .await;
    let _: LoginReq = gateway.expect(TYPE_LOGIN_REQ).await;
    assert!(rx.try_recv().is_err(), "nothing is dispatched before ready");
    gateway
        .send(
            TYPE_LOGIN_RSP,
            &LoginRsp {
                success: true,
                message: String::new(),
                server_time: 0,
            },
        )
        .await;

    // Assert
    assert_eq!(rx.recv().await, Some("early"));
    cancel.cancel();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_concurrent_sends_arrive_as_whole_frames() {
    // Arrange – payloads large enough to span several pipe writes
    const SENDERS: u64 = 20;
    let (client, _connector, mut gateways) = common::client(common::test_config());
    let cancel = CancellationToken::new();
    let run = spawn_run(&client, &cancel);
    let mut gateway = gateways.recv().await.unwrap();
    gateway.accept_handshake("dev-1").await;
    wait_ready(&client).await;

    // Act
    let senders: Vec<_> = (0..SENDERS)
        .map(|query_id| {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let query = QueryReq {
                    query_id,
                    kind: "x".repeat(8 * 1024),
                };
                client.send(&cancel, &query, SendOptions::default()).await
            })
        })
        .collect();
    let mut received = BTreeSet::new();
    for _ in 0..SENDERS {
        let query: QueryReq = gateway.expect(TYPE_QUERY_REQ).await;
        assert_eq!(query.kind.len(), 8 * 1024);
        received.insert(query.query_id);
    }

    // Assert
    for sender in senders {
        sender.await.unwrap().unwrap();
    }
    assert_eq!(received, (0..SENDERS).collect::<BTreeSet<_>>());
    cancel.cancel();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_coin_command_is_acknowledged_end_to_end() {
    // Arrange
    let (client, _connector, mut gateways) = common::client(common::test_config());
    client.subscribe(
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
    let cancel = CancellationToken::new();
    let run = spawn_run(&client, &cancel);
    let mut gateway = gateways.recv().await.unwrap();

    // Act
    let (register, login) = gateway.accept_handshake("dev-1").await;
    gateway
        .send(
            TYPE_COIN_COMMAND,
            &CoinCommand {
                order_id: 7,
                amount: 100,
                coin_count: 1,
            },
        )
        .await;
    let reply = gateway.next_frame().await.unwrap();

    // Assert
    assert_eq!(register.device_sn, "SN-1");
    assert_eq!((login.device_id.as_str(), login.token.as_str()), ("dev-1", "t"));
    assert_eq!(reply.message_type, TYPE_COIN_ACK);
    assert_eq!(reply.message_type.value(), 0x11);
    let ack: CoinAck = decode_payload(&reply.payload).unwrap();
    assert_eq!(
        ack,
        CoinAck {
            order_id: 7,
            state: CoinState::Accepted,
            progress: 0,
        }
    );
    cancel.cancel();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_failing_handler_does_not_end_the_session() {
    // Arrange
    let reported = Arc::new(AtomicUsize::new(0));
    let config = ClientConfig {
        on_error: Some(Arc::new({
            let reported = Arc::clone(&reported);
            move |_: &ClientError| {
                reported.fetch_add(1, Ordering::SeqCst);
            }
        })),
        ..common::test_config()
    };
    let (client, connector, mut gateways) = common::client(config);
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.subscribe(
        TYPE_COIN_COMMAND,
        handler_fn(|_ctx: HandlerContext, cmd: CoinCommand| async move {
            anyhow::ensure!(cmd.order_id != 1, "order 1 is cursed");
            Ok(())
        }),
    );
    record::<ErrorMsg>(&client, TYPE_ERROR, "after", &tx, Duration::ZERO);
    let cancel = CancellationToken::new();
    let run = spawn_run(&client, &cancel);
    let mut gateway = gateways.recv().await.unwrap();
    gateway.accept_handshake("dev-1").await;
    wait_ready(&client).await;

    // Act
    gateway
        .send(
            TYPE_COIN_COMMAND,
            &CoinCommand {
                order_id: 1,
                ..CoinCommand::default()
            },
        )
        .await;
    gateway.send(TYPE_ERROR, &ErrorMsg::default()).await;

    // Assert
    assert_eq!(rx.recv().await, Some("after"));
    assert_eq!(reported.load(Ordering::SeqCst), 1);
    assert_eq!(connector.connects(), 1);
    assert_eq!(client.state(), SessionState::Ready);
    cancel.cancel();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_cancel_does_not_wait_for_a_busy_handler() {
    // Arrange – the handler outlives any reasonable shutdown
    let (client, _connector, mut gateways) = common::client(common::test_config());
    let (entered_tx, mut entered) = mpsc::unbounded_channel();
    client.subscribe(
        TYPE_COIN_COMMAND,
        handler_fn(move |_ctx: HandlerContext, _cmd: CoinCommand| {
            let entered_tx = entered_tx.clone();
            async move {
                entered_tx.send(())?;
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
        }),
    );
    let cancel = CancellationToken::new();
    let run = spawn_run(&client, &cancel);
    let mut gateway = gateways.recv().await.unwrap();
    gateway.accept_handshake("dev-1").await;
    wait_ready(&client).await;
    gateway.send(TYPE_COIN_COMMAND, &CoinCommand::default()).await;
    entered.recv().await.unwrap();

    // Act
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(1), run).await;

    // Assert
    let result = result.expect("run must return while the handler is still busy");
    assert!(result.unwrap().is_ok());
    assert_eq!(client.state(), SessionState::Closed);
    assert_eq!(gateway.drain_until_closed().await, 0);
}
