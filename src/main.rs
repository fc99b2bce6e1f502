use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use anyhow::Context;
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

use medilink::access::Stores;
use medilink::config::{Config, default_log_filter};
use medilink::documents::HttpDocumentStore;
use medilink::handlers::{self, Services};
use medilink::store::{PgStore, build_pool, run_migrations};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_log_filter())),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    let pool = build_pool(&config).context("failed to create database pool")?;
    run_migrations(&pool).context("failed to apply migrations")?;

    let documents = HttpDocumentStore::new(&config.document_store_url, config.request_timeout)
        .context("failed to build document store client")?;
    let stores = Stores::new(Arc::new(PgStore::new(pool)), Arc::new(documents))
        .with_deadline(config.request_timeout);
    let services = web::Data::new(Services::new(stores));

    tracing::info!(addr = %config.bind_addr, port = config.port, "starting http server");
    HttpServer::new(move || {
        App::new()
            .app_data(services.clone())
            .configure(handlers::configure)
    })
    .bind((config.bind_addr.as_str(), config.port))
    .with_context(|| format!("failed to bind {}:{}", config.bind_addr, config.port))?
    .run()
    .await?;
    Ok(())
}
