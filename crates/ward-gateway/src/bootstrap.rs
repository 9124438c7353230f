//! Wires the gateway from CLI configuration and serves it.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use ward_bot::{TelegramBotConfig, TelegramBotTransport, TelegramStatusObserver};
use ward_call_runtime::{
    CallDispatcher, CallReconciler, CallRuntimeConfig, JsonlAuditObserver, ObserverSet,
    ResponseTimers,
};
use ward_call_store::SqliteCallStore;
use ward_presence::RecipientRegistry;

use crate::directory::{load_ward_directory, WardDirectory};
use crate::presence_observer::PresenceBroadcastObserver;
use crate::server::{build_ward_gateway_router, WardGatewayState};
use crate::WardGatewayCli;

pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

pub fn build_ward_gateway_state(cli: &WardGatewayCli) -> Result<Arc<WardGatewayState>> {
    std::fs::create_dir_all(&cli.state_dir)
        .with_context(|| format!("failed to create {}", cli.state_dir.display()))?;

    let directory = match &cli.directory {
        Some(path) => load_ward_directory(path)?,
        None => {
            tracing::warn!("no directory configured; every request will be rejected as unauthorized");
            WardDirectory::default()
        }
    };
    let WardDirectory {
        identities,
        authenticator,
        bot_links,
    } = directory;

    let store = SqliteCallStore::new(&cli.database)
        .with_context(|| format!("failed to open call store {}", cli.database.display()))?;
    let registry = Arc::new(RecipientRegistry::new());
    let bot_links = Arc::new(bot_links);
    let telegram = Arc::new(TelegramBotTransport::new(
        TelegramBotConfig {
            mode: cli.telegram_mode,
            api_base: cli.telegram_api_base.clone(),
            bot_token: cli.telegram_token.clone(),
            ..TelegramBotConfig::default()
        },
        Arc::clone(&bot_links),
    )?);

    let observers = ObserverSet::new()
        .with(Arc::new(JsonlAuditObserver::new(&cli.state_dir)))
        .with(Arc::new(PresenceBroadcastObserver::new(Arc::clone(&registry))))
        .with(Arc::new(TelegramStatusObserver::new(Arc::clone(&telegram))));
    let reconciler = Arc::new(CallReconciler::new(
        Arc::new(store),
        Arc::new(identities),
        Arc::new(ResponseTimers::new()),
        observers,
    ));
    let dispatcher = CallDispatcher::new(
        Arc::clone(&reconciler),
        Arc::clone(&registry),
        CallRuntimeConfig::with_response_window_ms(cli.response_window_ms),
    )
    .with_bot_transport(telegram);

    Ok(Arc::new(WardGatewayState {
        dispatcher,
        reconciler,
        registry,
        authenticator: Arc::new(authenticator),
        bot_links,
        telegram_webhook_secret: cli.telegram_webhook_secret.clone(),
    }))
}

pub async fn run_ward_gateway_server(cli: WardGatewayCli) -> Result<()> {
    let bind_addr = cli
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid --bind '{}'", cli.bind))?;
    let state = build_ward_gateway_state(&cli)?;

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind ward gateway on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound ward gateway address")?;
    tracing::info!(
        addr = %local_addr,
        database = %cli.database.display(),
        state_dir = %cli.state_dir.display(),
        response_window_ms = cli.response_window_ms,
        telegram_mode = cli.telegram_mode.as_str(),
        "ward gateway listening"
    );

    let app = build_ward_gateway_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("ward gateway server exited unexpectedly")?;
    tracing::info!("ward gateway stopped");
    Ok(())
}
