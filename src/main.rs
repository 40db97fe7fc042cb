use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use crucible_engine::{ExperimentOrchestrator, OrchestratorDeps, OrchestratorRegistry};
use crucible_llm::ProviderRouter;
use crucible_sandbox::{ContainerPool, DockerCli, PoolConfig};
use crucible_store::experiments::ExperimentRepo;
use crucible_store::secrets::PlaintextSecretStore;
use crucible_store::Database;

/// Multi-step, multi-agent experiment engine.
#[derive(Parser, Debug)]
#[command(name = "crucible", version, about)]
struct Args {
    /// Path to the SQLite database.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Pre-warmed container pool size.
    #[arg(long, default_value_t = 2)]
    pool_size: usize,

    /// Base image for execution contexts.
    #[arg(long, default_value = "python:3.11-slim")]
    image: String,

    /// Emit logs as line-delimited JSON.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    crucible_telemetry::init_logging("info", args.json_logs);

    tracing::info!("starting crucible");

    let db_path = args
        .db
        .unwrap_or_else(|| dirs_home().join(".crucible").join("crucible.db"));
    let db = Database::open(&db_path).expect("failed to open database");

    let pool = Arc::new(ContainerPool::new(
        Arc::new(DockerCli::new()),
        PoolConfig {
            image: args.image,
            target_size: args.pool_size,
            ..Default::default()
        },
    ));
    pool.initialize().await;

    let secrets = Arc::new(PlaintextSecretStore::new(db.clone()));
    let router = Arc::new(ProviderRouter::new(secrets));
    let registry = Arc::new(OrchestratorRegistry::new());

    let deps = OrchestratorDeps {
        db: db.clone(),
        pool: Arc::clone(&pool),
        router,
    };

    resume_running_experiments(&deps, &registry);

    tracing::info!(db = %db_path.display(), "crucible ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
    pool.shutdown().await;
}

/// Experiments left RUNNING by a previous process get a fresh
/// orchestrator; their loops pick up from the persisted step.
fn resume_running_experiments(deps: &OrchestratorDeps, registry: &Arc<OrchestratorRegistry>) {
    let experiments = ExperimentRepo::new(deps.db.clone());
    let running = match experiments.list_by_status(crucible_core::experiment::ExperimentStatus::Running) {
        Ok(running) => running,
        Err(e) => {
            tracing::error!(error = %e, "failed to scan for running experiments");
            return;
        }
    };

    for experiment in running {
        tracing::info!(experiment_id = %experiment.id, "resuming experiment");
        let orchestrator = Arc::new(ExperimentOrchestrator::new(
            experiment.id.clone(),
            deps.clone(),
        ));
        registry.register(Arc::clone(&orchestrator));

        let registry = Arc::clone(registry);
        drop(tokio::spawn(async move {
            let id = orchestrator.experiment_id().clone();
            if let Err(e) = orchestrator.start().await {
                tracing::error!(experiment_id = %id, error = %e, "resume failed");
            }
            registry.remove(&id);
        }));
    }
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
