//! Assignment service: hands out task instances stored in SQLite.

use anyhow::anyhow;
use clap::Parser;
use survey_api::helpers::init_tracing;
use survey_common::db_util::{
    DEFAULT_DATABASE_URL, get_database_pool, get_pooled_database_connection, initialize_schema,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path of the SQLite database file
    #[arg(long, default_value = DEFAULT_DATABASE_URL, env = "DATABASE_URL")]
    database_url: String,
}

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing();

    let pool = get_database_pool(&cli.database_url).map_err(|e| anyhow!(e))?;
    let mut conn = get_pooled_database_connection(&pool).map_err(|e| anyhow!(e))?;
    initialize_schema(&mut conn).map_err(|e| anyhow!(e))?;
    drop(conn);
    tracing::info!(database_url = %cli.database_url, "Database initialized");

    survey_api::assignment::build_rocket(pool)
        .launch()
        .await
        .map_err(|e| anyhow!("{e}"))?;
    Ok(())
}
