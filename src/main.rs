use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use claims_dtf::agents::OpenAiChatBackend;
use claims_dtf::api::{create_router, AppState};
use claims_dtf::claims::{register_activities, register_orchestration, ClaimServices, EscalationPolicy};
use claims_dtf::collaborators::{policy_id_is_valid, DirectoryLookup, FsBlobStorage, OutboxMessaging};
use claims_dtf::config::AppConfig;
use claims_dtf::providers::fs::FsHistoryStore;
use claims_dtf::providers::HistoryStore;
use claims_dtf::runtime::{ActivityRegistry, Runtime};
use claims_dtf::OrchestrationRegistry;

#[derive(Debug, Parser)]
#[command(name = "claims-dtf", version, about = "Durable insurance claim processing")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, env = "CLAIMS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API and the workflow runtime
    Serve {
        /// Overrides server.bind
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            serve(config).await
        }
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let backend = Arc::new(OpenAiChatBackend::new(&config.reasoning).context("creating reasoning backend")?);
    let lookups = &config.lookups.root;
    let services = ClaimServices::from_config(
        &config,
        backend,
        Arc::new(FsBlobStorage::new(&config.storage.root)),
        Arc::new(OutboxMessaging::new(&config.messaging.outbox_dir)),
        Arc::new(DirectoryLookup::new(lookups.join("schemas")).with_extension("json")),
        Arc::new(
            DirectoryLookup::new(lookups.join("policies"))
                .with_extension("md")
                .with_validator(policy_id_is_valid),
        ),
        Arc::new(
            DirectoryLookup::new(lookups.join("prior-claims"))
                .with_extension("json")
                .with_validator(policy_id_is_valid),
        ),
    );

    let activities = register_activities(ActivityRegistry::builder(), services).build();
    let orchestrations = register_orchestration(
        OrchestrationRegistry::builder(),
        EscalationPolicy::from(&config.escalation),
    )
    .build_result()
    .map_err(anyhow::Error::msg)?;

    let store: Arc<dyn HistoryStore> = Arc::new(FsHistoryStore::new(&config.store.root, false));
    let runtime =
        Runtime::start_with_options(store, Arc::new(activities), orchestrations, config.runtime.clone()).await;

    let app = create_router(AppState {
        runtime: runtime.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    info!(bind = %config.server.bind, "claims service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving HTTP")?;

    runtime.shutdown().await;
    Ok(())
}
