//! URL service: hands out task instances stored in Firestore.

use anyhow::{Result, anyhow, bail};
use clap::{Parser, ValueEnum};
use survey_api::helpers::init_tracing;
use survey_common::firestore::{
    DEFAULT_COLLECTION, DEFAULT_DATABASE, FIRESTORE_BASE_URL, FirestoreClient, FirestoreConfig,
    FirestoreTaskStore,
};
use survey_common::is_placeholder;
use survey_common::task_store::{MemoryTaskStore, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Firestore,
    Memory,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Where task instances are stored
    #[arg(long, value_enum, default_value = "firestore", env = "TASK_STORE")]
    backend: Backend,

    /// Google Cloud project holding the Firestore database
    #[arg(long, default_value = "", env = "FIRESTORE_PROJECT_ID")]
    project_id: String,

    /// Firestore database name
    #[arg(long, default_value = DEFAULT_DATABASE, env = "FIRESTORE_DATABASE")]
    database: String,

    /// Collection holding task instances
    #[arg(long, default_value = DEFAULT_COLLECTION, env = "TASKS_COLLECTION")]
    collection: String,

    /// Firestore REST endpoint; point at the emulator for local runs
    #[arg(long, default_value = FIRESTORE_BASE_URL, env = "FIRESTORE_BASE_URL")]
    base_url: String,

    /// OAuth access token for Firestore
    #[arg(long, env = "FIRESTORE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
}

fn build_store(cli: &Cli) -> Result<Box<dyn TaskStore>> {
    match cli.backend {
        Backend::Memory => {
            tracing::warn!("Using the in-memory task store; data is lost on restart");
            Ok(Box::new(MemoryTaskStore::new()))
        }
        Backend::Firestore => {
            if is_placeholder(&cli.project_id) {
                bail!("FIRESTORE_PROJECT_ID must be set for the firestore backend");
            }
            let client = FirestoreClient::new(&FirestoreConfig {
                project_id: cli.project_id.clone(),
                database: cli.database.clone(),
                base_url: cli.base_url.clone(),
                access_token: cli.access_token.clone(),
            })?;
            tracing::info!(
                project_id = %cli.project_id,
                collection = %cli.collection,
                "Using Firestore task store"
            );
            Ok(Box::new(FirestoreTaskStore::new(client, &cli.collection)))
        }
    }
}

#[rocket::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing();

    let store = build_store(&cli)?;
    survey_api::urls::build_rocket(store)
        .launch()
        .await
        .map_err(|e| anyhow!("{e}"))?;
    Ok(())
}
