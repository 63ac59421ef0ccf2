use anyhow::Result;
use bloc_pipeline::PipelineConfig;
use bloc_store::Store;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "bloc-cli")]
#[command(about = "Fontainebleau boulder reference loader")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the schema in the configured database.
    Migrate,
    /// Ingest raw sector bundles and bulk-load them in dependency order.
    Load,
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Load) {
        Commands::Migrate => {
            let store = Store::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("schema ready at {}", config.database_url);
        }
        Commands::Load => {
            let store = Store::connect(&config.database_url).await?;
            store.migrate().await?;
            let summary = bloc_pipeline::run_once(&store, &config).await?;
            println!(
                "load complete: sectors={} problems={} circuits={} repaired={} pairs={} skipped={}",
                summary.sectors,
                summary.problems,
                summary.circuits,
                summary.repaired_problems,
                summary.circuit_problems,
                summary.skipped_bundles
            );
        }
        Commands::Serve { port } => {
            let store = Store::connect(&config.database_url).await?;
            store.migrate().await?;
            bloc_web::serve(store, port).await?;
        }
    }

    Ok(())
}
