use std::io;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use notification_consumer::config::DeadLetterSinkKind;
use notification_consumer::{metrics, ConsumerMetrics, NotificationConsumer, RuntimeConfig};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting notification consumer");

    // Invalid mode/strategy combinations must stop the process here.
    let config = match RuntimeConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let pool = if config.dead_letter_sink == DeadLetterSinkKind::Database {
        let url = config
            .database_url
            .as_deref()
            .expect("validated by RuntimeConfig");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        sqlx::migrate!()
            .run(&pool)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        tracing::info!("Connected to error store");
        Some(pool)
    } else {
        None
    };

    let shared_metrics = Arc::new(ConsumerMetrics::new());

    for worker_id in 0..config.workers {
        let consumer = NotificationConsumer::from_config(
            config.clone(),
            shared_metrics.clone(),
            pool.clone(),
            worker_id,
        )
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = consumer.run().await {
                tracing::error!(worker_id, "Consumer worker stopped: {}", e);
            }
        });
    }
    tracing::info!(workers = config.workers, "Consumer workers started");

    let addr = format!("0.0.0.0:{}", config.http_port);
    tracing::info!("----------------------------------------------------------------");
    tracing::info!("Health available at: http://{}/health", addr);
    tracing::info!("Metrics available at: http://{}/metrics", addr);

    HttpServer::new(|| {
        App::new()
            .route("/health", web::get().to(|| async { "OK" }))
            .route("/metrics", web::get().to(metrics::serve_metrics))
    })
    .bind(&addr)?
    .run()
    .await
}
