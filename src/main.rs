use std::net::SocketAddr;

use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use bundle_vault::{config, db, routes, telemetry, Vault};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing();
    dotenvy::dotenv().ok();

    // Fail fast before touching the database if no master key is usable.
    let keyring = config::keyring_from_env()?;
    tracing::info!(?keyring, "master keyring loaded");

    let pool = db::connect(config::DATABASE_URL.as_str(), *config::DB_MAX_CONNECTIONS).await?;

    if let Err(error) = db::run_migrations(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let vault = Vault::with_bearer_identity(
        pool,
        keyring,
        config::BOOTSTRAP_ADMIN_SUBJECT.as_str(),
    );
    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(routes::router(vault))
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
