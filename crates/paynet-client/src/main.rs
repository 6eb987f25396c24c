//! `paynetcli`: a demo terminal that talks to a paynet gateway.
//!
//! Wires the paybox schema, a coin-acceptance handler, and shutdown signals
//! into a [`Client`], then runs it until Ctrl-C or SIGTERM.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ Cli::load_settings()     -- TOML file, then command-line overrides
//!  └─ register_schema()        -- paybox metas + logging default handlers
//!  └─ Client::new()            -- freezes the global registry
//!  └─ client.run()             -- reconnect loop until cancelled
//!       ├─ CoinCommand  -> CoinAck(ACCEPTED), later CoinAck(DONE)
//!       └─ QueryRsp     -> log
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use paynet_client::application::registry::{global, paybox_schema};
use paynet_client::domain::default_heartbeat_factory;
use paynet_client::{handler_fn, Client, Handler, HandlerContext, LoginFlow, Settings};
use paynet_core::protocol::paybox::{
    CoinAck, CoinCommand, CoinState, ErrorMsg, LoginReq, LoginRsp, Pong, QueryRsp, RegisterReq,
    RegisterRsp, TYPE_COIN_COMMAND, TYPE_ERROR, TYPE_LOGIN_RSP, TYPE_PONG, TYPE_QUERY_RSP,
    TYPE_REGISTER_RSP,
};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Delay between accepting a coin order and reporting it done.
const COIN_SETTLE_DELAY: Duration = Duration::from_secs(2);

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Demo payment terminal for the paynet gateway.
///
/// Settings come from `--config` when given; every other flag overrides the
/// matching value from the file.
#[derive(Debug, Parser)]
#[command(
    name = "paynetcli",
    about = "Demo paybox terminal: registers, logs in, and acknowledges coin commands",
    version
)]
struct Cli {
    /// Path to a TOML settings file.
    #[arg(long, env = "PAYNET_CONFIG")]
    config: Option<PathBuf>,

    /// Gateway address as `host:port`.
    #[arg(long, env = "PAYNET_ADDR")]
    addr: Option<String>,

    /// Device certificate chain (PEM).
    #[arg(long, env = "PAYNET_CERT")]
    cert: Option<PathBuf>,

    /// Device private key (PEM).
    #[arg(long, env = "PAYNET_KEY")]
    key: Option<PathBuf>,

    /// CA bundle used to verify the gateway (PEM).
    #[arg(long, env = "PAYNET_CA")]
    ca: Option<PathBuf>,

    /// Name the gateway certificate must carry.
    #[arg(long, env = "PAYNET_SERVER_NAME")]
    server_name: Option<String>,

    /// Seconds between heartbeats.
    #[arg(long, env = "PAYNET_HEARTBEAT_SECS")]
    heartbeat_secs: Option<u64>,
}

impl Cli {
    /// Loads the settings file (or defaults) and applies flag overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings file cannot be read or parsed.
    fn load_settings(self) -> anyhow::Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)
                .with_context(|| format!("failed to load settings from {}", path.display()))?,
            None => Settings::default(),
        };

        if let Some(addr) = self.addr {
            settings.addr = addr;
        }
        if let Some(cert) = self.cert {
            settings.tls.cert_file = cert;
        }
        if let Some(key) = self.key {
            settings.tls.key_file = key;
        }
        if let Some(ca) = self.ca {
            settings.tls.ca_file = ca;
        }
        if let Some(name) = self.server_name {
            settings.tls.server_name = name;
        }
        if let Some(secs) = self.heartbeat_secs {
            settings.heartbeat.interval_secs = secs;
        }
        Ok(settings)
    }
}

// ── Schema and handlers ───────────────────────────────────────────────────────

/// Registers the paybox schema globally, with logging defaults for the
/// gateway's informational messages.
fn register_schema() {
    for meta in paybox_schema() {
        let meta = match meta.message_type {
            TYPE_REGISTER_RSP => meta.with_handler(handler_fn(|_ctx, rsp: RegisterRsp| async move {
                info!(device_id = %rsp.device_id, success = rsp.success, "late register response");
                Ok(())
            })),
            TYPE_LOGIN_RSP => meta.with_handler(handler_fn(|_ctx, rsp: LoginRsp| async move {
                info!(success = rsp.success, message = %rsp.message, "late login response");
                Ok(())
            })),
            TYPE_PONG => meta.with_handler(handler_fn(|_ctx, pong: Pong| async move {
                debug!(echo = pong.timestamp, server_time = pong.server_time, "pong");
                Ok(())
            })),
            TYPE_ERROR => meta.with_handler(handler_fn(|_ctx, err: ErrorMsg| async move {
                warn!(code = err.code, message = %err.message, "gateway reported an error");
                Ok(())
            })),
            _ => meta,
        };
        global::must_register(meta);
    }
}

/// Acknowledges a coin order immediately, then reports it done once the
/// coins have settled.
fn on_coin_command() -> Arc<dyn Handler> {
    handler_fn(|ctx: HandlerContext, cmd: CoinCommand| async move {
        let order_id = cmd.order_id;
        info!(order_id, amount = cmd.amount, coins = cmd.coin_count, "coin command received");
        ctx.send(&CoinAck {
            order_id,
            state: CoinState::Accepted,
            progress: 0,
        })
        .await?;

        let follow_up = ctx.clone();
        ctx.spawn(async move {
            tokio::time::sleep(COIN_SETTLE_DELAY).await;
            follow_up
                .send(&CoinAck {
                    order_id,
                    state: CoinState::Done,
                    progress: 100,
                })
                .await?;
            info!(order_id, "coin order completed");
            Ok(())
        });
        Ok(())
    })
}

fn on_query_rsp() -> Arc<dyn Handler> {
    handler_fn(|_ctx, rsp: QueryRsp| async move {
        info!(
            query_id = rsp.query_id,
            success = rsp.success,
            bytes = rsp.body.len(),
            "query response"
        );
        Ok(())
    })
}

fn demo_flow() -> LoginFlow {
    LoginFlow {
        register: RegisterReq {
            device_sn: "SN-demo-001".to_string(),
            model: "paybox-mini".to_string(),
            firmware: "1.0.0".to_string(),
            device_pubkey: b"fake".to_vec(),
        },
        login: LoginReq {
            device_id: "dev-SN-demo-001".to_string(),
            token: "demo-token".to_string(),
            version: "1.0.0".to_string(),
        },
    }
}

// ── Shutdown ──────────────────────────────────────────────────────────────────

/// Cancels `cancel` on Ctrl-C, or on SIGTERM where available.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    cancel.cancel();
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    // RUST_LOG wins over the settings file.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log_level)),
        )
        .init();

    register_schema();
    let config = settings.into_client_config(default_heartbeat_factory());
    info!(addr = %config.addr, server_name = %config.tls.server_name, "paynetcli starting");

    let client = Client::new(config).context("failed to create client")?;
    client.subscribe(TYPE_COIN_COMMAND, on_coin_command());
    client.subscribe(TYPE_QUERY_RSP, on_query_rsp());

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let mut events = client.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(?event, "client event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    client
        .run(cancel, demo_flow())
        .await
        .context("client stopped with an error")?;

    info!("paynetcli stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
