use anyhow::Result;
use clap::{Parser, Subcommand};
use gamedex_store::SharedCatalog;
use gamedex_web::AppState;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gamedex")]
#[command(about = "Games catalog ingestion and serving")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load the CSV sources into the catalog and print a run summary.
    Ingest,
    /// Ingest, then serve the catalog over HTTP.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_summary(summary: &gamedex_ingest::IngestSummary) {
    println!(
        "ingest complete: run_id={} seen={} inserted={} missing_description={} schema_rejected={}{}",
        summary.run_id,
        summary.products_seen,
        summary.inserted,
        summary.missing_description,
        summary.schema_rejected,
        if summary.already_initialized {
            " (catalog already initialized)"
        } else {
            ""
        }
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let catalog = SharedCatalog::new();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Ingest => {
            let summary = gamedex_ingest::run_ingest_from_env(&catalog)?;
            print_summary(&summary);
        }
        Commands::Serve => {
            let summary = gamedex_ingest::run_ingest_from_env(&catalog)?;
            print_summary(&summary);
            gamedex_web::serve_from_env(AppState::new(catalog)).await?;
        }
    }

    Ok(())
}
