use clap::{Parser, Subcommand};
use query_engine::{MokaQueryClient, ReqwestTransport};
use scraper::{FetchStatus, PolicyOverrides, QueryHandle, QueryState, QueryStatus, ScraperQueries};
use shared::config::Config;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Query the sports scraping backend and print the JSON it returns.
#[derive(Debug, Parser)]
#[command(name = "scraper", version, about)]
struct Cli {
    /// Backend base URL (defaults to SCRAPER_API_BASE, then the public backend)
    #[arg(long, global = true)]
    api_base: Option<String>,

    /// Retry budget override for the chosen query
    #[arg(long, global = true)]
    retry: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scrape the current secret phrases
    SecretPhrases,
    /// Scrape prediction outcomes for a sport
    Predictions {
        #[arg(long, default_value = scraper::DEFAULT_SPORT)]
        sport: String,
    },
    /// Scrape an arbitrary page with a CSS selector
    Advanced {
        #[arg(long)]
        url: String,
        #[arg(long)]
        selector: String,
    },
    /// Scrape real-time odds for a sport
    Odds {
        #[arg(long, default_value = scraper::DEFAULT_SPORT)]
        sport: String,
        /// Keep printing every background refresh until interrupted
        #[arg(long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Logs go to stderr so stdout stays valid JSON
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match dotenvy::dotenv() {
        Ok(_) => info!("Loaded environment variables from .env file"),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(api_base) = cli.api_base {
        config.api_base = api_base;
    }

    let client = MokaQueryClient::from_config(&config);
    let transport = ReqwestTransport::from_config(&config)?;
    let queries = ScraperQueries::new(&config, Arc::new(client), Arc::new(transport))?;
    info!("Using scraper backend at {}", queries.api_base());

    let overrides = PolicyOverrides {
        retry: cli.retry,
        ..PolicyOverrides::default()
    };

    let mut handle = match &cli.command {
        Command::SecretPhrases => queries.secret_phrases(&overrides),
        Command::Predictions { sport } => queries.prediction_outcomes(Some(sport.as_str()), &overrides),
        Command::Advanced { url, selector } => {
            if url.is_empty() || selector.is_empty() {
                error!("--url and --selector must both be non-empty");
                return Ok(ExitCode::FAILURE);
            }
            queries.advanced_scrape(url, selector, true, &overrides)
        }
        Command::Odds { sport, watch: true } => {
            let handle = queries.real_time_odds(Some(sport.as_str()), &overrides);
            watch_odds(handle).await?;
            return Ok(ExitCode::SUCCESS);
        }
        Command::Odds { sport, watch: false } => queries.real_time_odds(Some(sport.as_str()), &overrides),
    };

    let state = handle.settled().await?;
    Ok(print_state(&state)?)
}

async fn watch_odds(mut handle: QueryHandle) -> Result<(), Box<dyn std::error::Error>> {
    info!("Watching '{}', press Ctrl+C to stop", handle.key());
    let initial = handle.settled().await?;
    print_state(&initial)?;

    loop {
        tokio::select! {
            changed = handle.changed() => {
                let state = changed?;
                if state.fetch_status == FetchStatus::Idle {
                    print_state(&state)?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C signal");
                return Ok(());
            }
        }
    }
}

fn print_state(state: &QueryState) -> Result<ExitCode, serde_json::Error> {
    match (state.status, &state.data, &state.error) {
        (QueryStatus::Error, _, Some(err)) => {
            error!("Query failed after {} attempt(s): {}", state.failure_count, err);
            Ok(ExitCode::FAILURE)
        }
        (_, Some(data), _) => {
            println!("{}", serde_json::to_string_pretty(data)?);
            Ok(ExitCode::SUCCESS)
        }
        _ => {
            error!("Query finished without data");
            Ok(ExitCode::FAILURE)
        }
    }
}
