mod audio_cache;
mod config;
mod cost;
mod error;
mod fanout;
mod handlers;
mod identity;
mod identity_store;
mod jwt;
mod persist;
mod registry;
mod token_cache;
mod tts;

use crate::audio_cache::AudioCache;
use crate::config::Config;
use crate::fanout::FanoutIndex;
use crate::handlers::websocket::router::Router as MessageRouter;
use crate::handlers::websocket::ConnectionTable;
use crate::identity::{DevValidator, IdentityValidator, ProviderValidator, TokenMinter};
use crate::identity_store::AdminIdentityStore;
use crate::registry::SessionRegistry;
use crate::token_cache::TokenCache;
use crate::tts::{HttpSynthesisClient, SynthesisClient, TtsPipeline, VoiceTable};
use anyhow::Context;
use axum::routing::get;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug, Clone)]
#[command(name = "translate-server")]
#[command(about = "Local real-time translation broadcast server")]
struct Args {
    /// Accept any admin credentials without an identity provider
    #[arg(long)]
    dev_mode: bool,
}

pub struct AppState {
    pub config: Arc<Config>,
    pub connections: Arc<ConnectionTable>,
    pub router: MessageRouter,
    pub registry: Arc<SessionRegistry>,
    pub audio_cache: Arc<AudioCache>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.dev_mode {
        warn!("DEV MODE ENABLED - identity provider is bypassed");
    }

    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env(args.dev_mode)?);

    // Persistent state: admin identities and session records.
    let identities = Arc::new(
        AdminIdentityStore::open(&config.admin_state_dir)
            .await
            .context("opening admin identity store")?,
    );
    let registry = Arc::new(
        SessionRegistry::open(&config.session_state_dir, config.session_retention)
            .await
            .context("opening session registry")?,
    );
    if !registry.is_empty() {
        info!("recovered {} sessions from disk", registry.len());
    }
    // Sessions not recovered (ended or stale) must not linger as owned
    // links on admin records.
    identities
        .prune_owned_sessions(|session_id| registry.get(session_id).is_some())
        .await;

    let audio_cache = Arc::new(
        AudioCache::open(
            &config.audio_cache_dir,
            config.audio_cache_max_bytes,
            &config.token_secret,
            config.audio_url_ttl,
            &config.public_base_url,
        )
        .await
        .context("opening audio cache")?,
    );

    let minter = TokenMinter::new(
        &config.token_secret,
        config.access_token_ttl,
        config.refresh_token_ttl,
    );
    let validator: Arc<dyn IdentityValidator> = if config.dev_mode {
        Arc::new(DevValidator::new(minter))
    } else {
        Arc::new(ProviderValidator::new(
            config
                .identity_provider_url
                .clone()
                .expect("checked at config load"),
            config
                .identity_client_id
                .clone()
                .expect("checked at config load"),
            minter,
        ))
    };

    let synthesis: Option<Arc<dyn SynthesisClient>> = config.tts_endpoint.clone().map(|endpoint| {
        Arc::new(HttpSynthesisClient::new(endpoint, config.tts_api_key.clone()))
            as Arc<dyn SynthesisClient>
    });
    if synthesis.is_none() {
        warn!("TTS_ENDPOINT not set; paid synthesis disabled, sessions fall back to device synthesis");
    }
    let tts = Arc::new(TtsPipeline::new(
        audio_cache.clone(),
        synthesis,
        VoiceTable::with_overrides(&config.tts_voice_overrides),
        config.tts_timeout,
    ));

    let connections = Arc::new(ConnectionTable::new());
    let token_cache = Arc::new(TokenCache::new());
    let router = MessageRouter::new(
        config.clone(),
        validator,
        identities.clone(),
        token_cache.clone(),
        registry.clone(),
        Arc::new(FanoutIndex::new()),
        tts,
        connections.clone(),
    );

    // Token lifecycle sweep: expiry warnings, then expired-session closes.
    {
        let router = router.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                router.sweep_tokens();
            }
        });
    }

    // Audio cache age sweep.
    {
        let audio_cache = audio_cache.clone();
        let max_age = config.audio_cache_max_age;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(600));
            loop {
                ticker.tick().await;
                audio_cache.sweep_older_than(max_age).await;
            }
        });
    }

    // Admin identity retention sweep.
    {
        let identities = identities.clone();
        let connections = connections.clone();
        let retention = config.admin_retention;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                identities
                    .sweep_idle(retention, |admin_id| {
                        connections.has_admin_connection(admin_id)
                    })
                    .await;
            }
        });
    }

    let app_state = Arc::new(AppState {
        config: config.clone(),
        connections,
        router: router.clone(),
        registry,
        audio_cache,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = axum::Router::new()
        .route("/health", get(handlers::health::health))
        .route("/audio/:file", get(handlers::audio::serve_audio))
        .route("/ws", get(handlers::websocket::handle_websocket))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = format!("{}:{}", config.bind_host, config.bind_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Listening on {}", listener.local_addr()?);

    let shutdown_router = router.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received, draining connections");
            shutdown_router.shutdown("server shutting down").await;
        })
        .await?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
