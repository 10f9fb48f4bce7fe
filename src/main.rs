//! SchemaFlow Ontology - extraction and governance service
//!
//! Turns a relational schema into a reviewed domain model:
//! - Capture: tables, columns and foreign keys from the target database
//! - Discovery: entities and bidirectional relationship pairs
//! - Enrichment: descriptions, labels and column meanings from a language model
//! - Glossary: business terms with SQL validated against the target
//! - Governance: every generated change is staged for review

mod config;
mod error;
mod generation;
mod governance;
mod introspection;
mod ledger;
mod models;
mod occurrence;
mod pipeline;
mod questions;
mod routes;
mod simulation;
mod state;
mod store;
#[cfg(test)]
mod testing;

use crate::config::{DatabaseConfig, Settings};
use crate::generation::{GenerationClient, Generator};
use crate::introspection::{PostgresIntrospector, SchemaSource};
use crate::pipeline::Capabilities;
use crate::routes::create_router;
use crate::simulation::{DryRunner, SqlValidator, StaticAnalyzer};
use crate::state::AppState;
use crate::store::{OntologyStore, PgJournal};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    info!("Starting SchemaFlow Ontology...");

    let settings = Settings::load()?;
    info!(
        max_concurrency = settings.pipeline.max_concurrency,
        glossary_max_attempts = settings.pipeline.glossary_max_attempts,
        "Configuration loaded"
    );

    // Metadata store: Postgres journal when configured, memory otherwise
    let store = match &settings.database {
        Some(database) => {
            let pool = init_database_pool(database).await?;
            let journal = PgJournal::new(pool);
            journal.ensure_tables().await?;
            Arc::new(OntologyStore::new(Arc::new(journal)))
        }
        None => {
            warn!("DATABASE_URL not set, ontologies will not survive a restart");
            Arc::new(OntologyStore::in_memory())
        }
    };
    let hydrated = store.hydrate().await?;
    info!(ontologies = hydrated, "Ontology store hydrated");

    let capabilities = init_capabilities(&settings).await?;
    let state = Arc::new(AppState::new(&settings, store, capabilities));

    let app = create_router(state, &settings);
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("Server listening on http://{}", addr);
    info!("   GET  /api/ontologies                               - List ontologies");
    info!("   POST /api/ontologies                               - Create an ontology");
    info!("   POST /api/ontologies/{{id}}/extraction/start         - Run the extraction DAG");
    info!("   GET  /api/ontologies/{{id}}/changes?status=pending   - Review staged changes");
    info!("   GET  /api/ontologies/{{id}}/questions?status=open    - Open questions");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging; `LOG_FORMAT=json` for JSON lines
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,schemaflow_ontology=debug,tower_http=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }
}

/// Wire the collaborators the stages need from configuration
async fn init_capabilities(settings: &Settings) -> anyhow::Result<Capabilities> {
    let mut capabilities = Capabilities::default();

    match &settings.target {
        Some(target) => {
            let pool = init_database_pool(target).await?;
            capabilities.schema_source = Some(Arc::new(PostgresIntrospector::new(pool.clone())) as Arc<dyn SchemaSource>);
            capabilities.validator = Some(Arc::new(DryRunner::new(pool)) as Arc<dyn SqlValidator>);
            info!("Target database connected: capture and dry-run validation enabled");
        }
        None => {
            capabilities.validator = Some(Arc::new(StaticAnalyzer::new()) as Arc<dyn SqlValidator>);
            warn!("TARGET_DATABASE_URL not set, schema capture is unavailable and glossary SQL is checked statically");
        }
    }

    match &settings.generation {
        Some(generation) => {
            let client = GenerationClient::new(generation)?;
            info!(model = %generation.model, "Generation client configured");
            capabilities.generator = Some(Arc::new(client) as Arc<dyn Generator>);
        }
        None => warn!("GENERATION_BASE_URL not set, enrichment stages will fail until configured"),
    }

    Ok(capabilities)
}

/// Build a connection pool and verify it with a round trip
async fn init_database_pool(database: &DatabaseConfig) -> anyhow::Result<deadpool_postgres::Pool> {
    use deadpool_postgres::{Config, ManagerConfig, PoolConfig, RecyclingMethod};

    let config = database
        .url
        .parse::<tokio_postgres::Config>()
        .map_err(|e| anyhow::anyhow!("Failed to parse database url: {}", e))?;

    let host = match config.get_hosts().first() {
        Some(tokio_postgres::config::Host::Tcp(host)) => host.clone(),
        Some(_) => return Err(anyhow::anyhow!("Unix socket connections are not supported")),
        None => return Err(anyhow::anyhow!("No host in database url")),
    };
    let port = config.get_ports().first().copied().unwrap_or(5432);
    let user = config
        .get_user()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("No user in database url"))?;
    let password = config
        .get_password()
        .map(|p| String::from_utf8_lossy(p).to_string())
        .unwrap_or_default();
    let dbname = config
        .get_dbname()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("No database name in database url"))?;

    let use_tls = host.contains("neon.tech") || database.url.contains("sslmode=require");

    let mut cfg = Config::new();
    cfg.host = Some(host.clone());
    cfg.port = Some(port);
    cfg.user = Some(user);
    cfg.password = Some(password);
    cfg.dbname = Some(dbname);
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(database.max_pool_size));

    let pool = if use_tls {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

        cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), tls)
            .map_err(|e| anyhow::anyhow!("Failed to create TLS pool: {}", e))?
    } else {
        cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), tokio_postgres::NoTls)
            .map_err(|e| anyhow::anyhow!("Failed to create pool: {}", e))?
    };

    let client = pool
        .get()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get pool connection: {}", e))?;
    client
        .query_one("SELECT 1", &[])
        .await
        .map_err(|e| anyhow::anyhow!("Failed to verify database connection: {}", e))?;

    info!(host = %host, tls = use_tls, "Database connection successful");
    Ok(pool)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
