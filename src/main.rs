mod models;
mod service;
mod config;
mod dtos;
mod error;
mod db;
mod utils;
mod middleware;
mod mail;
mod handler;
mod routes;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use axum::http::{header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE}, HeaderName, HeaderValue, Method};
use chrono::Duration;
use config::Config;
use db::{
    cache::{CachePort, NoCache, RedisCache},
    db::DBClient,
    memory::InMemoryStore,
    Store,
};
use dotenv::dotenv;
use mail::sendmail::{Notifier, ResendMailer};
use routes::create_router;
use service::{
    access_service::AccessService,
    audit_service::AuditService,
    deposit_service::DepositService,
    document_service::{DocumentRenderer, HttpDocumentRenderer, LoggingRenderer},
    effects::EffectRunner,
    otp_service::OtpService,
    payment_provider::{PaymentGateway, StripeGateway},
    portal_service::PortalService,
    proposal_service::ProposalService,
};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::filter::LevelFilter;

/// Outbound integrations, swapped for fakes in tests.
pub struct Adapters {
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub renderer: Arc<dyn DocumentRenderer>,
    pub cache: Arc<dyn CachePort>,
}

#[derive(Clone)]
pub struct AppState {
    pub env: Config,
    pub store: Arc<dyn Store>,
    pub cache: Arc<dyn CachePort>,
    pub access_service: AccessService,
    pub otp_service: OtpService,
    pub proposal_service: ProposalService,
    pub deposit_service: DepositService,
    pub portal_service: PortalService,
}

impl AppState {
    /// `detached_effects` spawns post-commit work instead of awaiting it.
    pub fn new(config: Config, store: Arc<dyn Store>, adapters: Adapters, detached_effects: bool) -> Self {
        let audit_service = AuditService::new(store.clone());
        let effects = EffectRunner::new(
            audit_service,
            adapters.notifier.clone(),
            adapters.renderer.clone(),
            adapters.cache.clone(),
            detached_effects,
        );

        let access_service = AccessService::new(
            store.clone(),
            effects.clone(),
            Duration::hours(config.session_ttl_hours),
            Duration::hours(config.magic_link_ttl_hours),
        );
        let otp_service = OtpService::new(
            store.clone(),
            effects.clone(),
            adapters.notifier.clone(),
            config.otp_max_requests,
            Duration::minutes(config.otp_window_minutes),
        );
        let portal_service = PortalService::new(store.clone(), effects.clone());
        let proposal_service = ProposalService::new(
            store.clone(),
            adapters.cache.clone(),
            effects.clone(),
            portal_service.clone(),
        );
        let deposit_service = DepositService::new(
            store.clone(),
            effects,
            adapters.gateway.clone(),
            config.default_portal_duration_days,
        );

        Self {
            env: config,
            store,
            cache: adapters.cache,
            access_service,
            otp_service,
            proposal_service,
            deposit_service,
            portal_service,
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    let config = match Config::init() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {:#}", err);
            std::process::exit(1);
        }
    };

    let log_level = config
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::DEBUG);
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .init();

    let mut demo = None;
    let store: Arc<dyn Store> = match &config.database_url {
        Some(database_url) => {
            let pool = match PgPoolOptions::new()
                .max_connections(20)
                .min_connections(2)
                .connect(database_url)
                .await
            {
                Ok(pool) => {
                    tracing::info!("Connection to the database is successful");
                    pool
                }
                Err(err) => {
                    tracing::error!("Failed to connect to the database: {:?}", err);
                    std::process::exit(1);
                }
            };

            if let Err(err) = sqlx::migrate!("./migrations").run(&pool).await {
                tracing::error!("Failed to run migrations: {}", err);
                std::process::exit(1);
            }
            Arc::new(DBClient::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, running on the in-memory store with demo data");
            let store = InMemoryStore::new();
            demo = Some(store.seed_demo().await);
            Arc::new(store)
        }
    };

    let cache: Arc<dyn CachePort> = match &config.redis_url {
        Some(redis_url) => match RedisCache::connect(redis_url).await {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                tracing::warn!("Redis initialization error: {} - running without cache", e);
                Arc::new(NoCache)
            }
        },
        None => {
            tracing::info!("Redis not configured - running without cache (set REDIS_URL to enable)");
            Arc::new(NoCache)
        }
    };

    let renderer: Arc<dyn DocumentRenderer> = match &config.document_service_url {
        Some(url) => Arc::new(HttpDocumentRenderer::new(url.clone())),
        None => Arc::new(LoggingRenderer),
    };

    let adapters = Adapters {
        gateway: Arc::new(StripeGateway::new(&config)),
        notifier: Arc::new(ResendMailer::new(&config)),
        renderer,
        cache,
    };
    let app_state = Arc::new(AppState::new(config.clone(), store, adapters, true));

    if let Some((tenant, client, proposal)) = demo {
        match app_state
            .access_service
            .issue_magic_link(tenant.id, client.id, proposal.id, None, None)
            .await
        {
            Ok(link) => tracing::info!(
                "Demo proposal {} is open at {}/access/{}",
                proposal.quote_number,
                config.app_url,
                link.token
            ),
            Err(e) => tracing::warn!("Could not issue demo magic link: {}", e),
        }
    }

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin {}", origin);
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_headers([
            AUTHORIZATION,
            ACCEPT,
            CONTENT_TYPE,
            HeaderName::from_static(middleware::SESSION_HEADER),
            HeaderName::from_static(middleware::TENANT_HEADER),
        ])
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT]);

    let app = create_router(app_state.clone()).layer(cors);

    tracing::info!(
        "Server is running on http://localhost:{} (store: {}, cache: {})",
        config.port,
        app_state.store.backend(),
        app_state.cache.status()
    );

    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", &config.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!("Failed to bind port {}: {}", config.port, err);
            std::process::exit(1);
        }
    };

    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", err);
    }
}
