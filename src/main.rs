//! Ad marketplace backend server.
//!
//! Wires the SQLite ledger, the REST payment gateway client, and the three
//! engines into an axum router. All configuration comes from flags or the
//! environment; the gateway client is constructed here once and injected.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use admarket_backend::{
    api::{create_router, AppState},
    auth::JwtHandler,
    engine::{ReconciliationEngine, RefundEngine, SelectionEngine},
    gateway::{PaymentGateway, RestGateway},
    ledger::LedgerDb,
};

#[derive(Parser, Debug)]
#[command(name = "admarket", about = "Ad marketplace payment & ledger backend")]
struct Config {
    #[arg(long, env = "ADMARKET_PORT", default_value_t = 8080)]
    port: u16,

    #[arg(long, env = "ADMARKET_DB", default_value = "admarket.db")]
    db_path: String,

    #[arg(long, env = "GATEWAY_BASE_URL", default_value = "https://api.flutterwave.com/v3")]
    gateway_base_url: String,

    /// Secret key sent as a bearer token on every gateway call.
    #[arg(long, env = "GATEWAY_SECRET_KEY")]
    gateway_secret: String,

    /// Shared secret the gateway echoes back in the `verif-hash` header.
    #[arg(long, env = "GATEWAY_WEBHOOK_HASH")]
    webhook_hash: String,

    #[arg(long, env = "JWT_SECRET")]
    jwt_secret: String,

    /// Where the hosted checkout redirects the payer afterwards.
    #[arg(long, env = "PAYMENT_REDIRECT_URL", default_value = "http://localhost:8080/api/payments/verify")]
    redirect_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "admarket_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();

    let db = LedgerDb::new(&config.db_path).context("open ledger database")?;
    let gateway: Arc<dyn PaymentGateway> = Arc::new(
        RestGateway::new(config.gateway_base_url.clone(), &config.gateway_secret)
            .context("build gateway client")?,
    );

    let state = AppState {
        db: db.clone(),
        selections: SelectionEngine::new(db.clone()),
        reconcile: ReconciliationEngine::new(
            db.clone(),
            gateway.clone(),
            config.redirect_url.clone(),
            config.webhook_hash.clone(),
        ),
        refunds: RefundEngine::new(db, gateway),
    };
    let jwt = Arc::new(JwtHandler::new(&config.jwt_secret));

    let app = create_router(state, jwt)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("admarket backend listening on {addr}");
    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}
