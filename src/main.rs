use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use notification_reconciler::config;
use notification_reconciler::notification::{
    Handler, HandlerConfig, HttpWebhookProvider, PgEventRepository,
};
use notification_reconciler::routes::admin_routes;
use sqlx::postgres::PgPoolOptions;
use tracing::info_span;
use tracing_subscriber::{fmt, EnvFilter};

async fn root() -> &'static str {
    "Notification Reconciler"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let provider = HttpWebhookProvider::from_env()?;
    let handler = Handler::new(
        Arc::new(PgEventRepository::new(pool.clone())),
        Arc::new(provider),
        HandlerConfig::from_env(),
        info_span!("notification_reconciler"),
    );
    handler.start()?;

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(admin_routes())
        .layer(prometheus_layer)
        .layer(Extension(handler.clone()));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    let stopped = handler.clone();
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
                _ = stopped.stopped() => tracing::warn!("notification reconciler stopped, shutting down"),
            }
        })
        .await?;

    handler.shutdown().await;
    Ok(())
}
