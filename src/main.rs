use nabr_trust_orchestrator::config::Config;
use nabr_trust_orchestrator::notifier::LoggingNotifier;
use nabr_trust_orchestrator::registry::OrchestratorRegistry;
use nabr_trust_orchestrator::store::postgres::PostgresStore;
use nabr_trust_orchestrator::store::VerificationStore;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::from_env()?);
    let store: Arc<dyn VerificationStore> = Arc::new(PostgresStore::connect(&config.database_url).await?);
    let notifier = Arc::new(LoggingNotifier);

    let _registry = Arc::new(OrchestratorRegistry::new(store, notifier, config));

    info!("progressive-trust verification orchestrator ready");

    // The HTTP API surface, signup, and transport layers that would
    // drive `_registry` via signals/queries are out of scope (§1); this
    // binary exists to stand the orchestrator up as a standalone
    // process behind whatever external surface wires into it.
    tokio::signal::ctrl_c().await?;
    Ok(())
}
