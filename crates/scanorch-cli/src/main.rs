use clap::{Parser, Subcommand};
use scanorch_cli::{serve_cmd, state};
use scanorch_db::config::Config;
use scanorch_db::pool;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "scanorch", about = "Multi-tenant SEO scan orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API until interrupted.
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Ensure the database exists and apply pending migrations.
    Migrate,
    /// Run one cache-sweep cycle and exit.
    SweepCache,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Serve { bind, port } => cmd_serve(&config, &bind, port).await,
        Commands::Migrate => cmd_migrate(&config).await,
        Commands::SweepCache => cmd_sweep_cache(&config).await,
    }
}

async fn cmd_serve(config: &Config, bind: &str, port: u16) -> anyhow::Result<()> {
    pool::ensure_database_exists(&config.db).await?;
    let db_pool = pool::create_pool(&config.db).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let cancel = CancellationToken::new();
    let (state, sweeper_join) = state::build(db_pool.clone(), config, cancel.clone());

    match scanorch_core::orchestrator::recover_orphaned_scans(
        &state.pool,
        &state.sink,
        &state.orchestrator_config,
        &state.cache_ttl,
    )
    .await
    {
        Ok(recovered) if recovered > 0 => {
            tracing::warn!(recovered, "recovered orphaned running scans at startup");
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "orphan scan recovery failed at startup"),
    }

    let result = serve_cmd::run_serve(state, bind, port).await;

    cancel.cancel();
    let _ = sweeper_join.await;
    db_pool.close().await;
    result
}

async fn cmd_migrate(config: &Config) -> anyhow::Result<()> {
    pool::ensure_database_exists(&config.db).await?;
    let db_pool = pool::create_pool(&config.db).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let counts = pool::table_counts(&db_pool).await?;
    for (table, count) in counts {
        println!("{table}: {count} rows");
    }

    db_pool.close().await;
    Ok(())
}

async fn cmd_sweep_cache(config: &Config) -> anyhow::Result<()> {
    let db_pool = pool::create_pool(&config.db).await?;
    let removed = scanorch_db::queries::cache::sweep_expired(&db_pool).await?;
    println!("removed {removed} expired cache entries");
    db_pool.close().await;
    Ok(())
}
