use clap::{Parser, Subcommand};
use std::path::PathBuf;

use paceline::activity::ProviderKind;
use paceline::config;
use paceline::store::ActivityStore;
use paceline::sync::{SyncJob, rebuild};

#[derive(Parser)]
#[command(name = "paceline", about = "Sync fitness activity history from multiple providers")]
struct Cli {
    /// Directory holding the canonical store, cursors, and outputs
    #[arg(long, default_value = "data", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch new activities from every configured provider
    Sync {
        /// Restrict to specific providers (repeatable)
        #[arg(long = "provider")]
        providers: Vec<ProviderKind>,
    },
    /// Regenerate all track files and the aggregate from the store
    Rebuild,
    /// Print the canonical collection
    List,
}

pub async fn cli_main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Cli::parse();

    match args.command {
        Commands::Sync { providers } => {
            let clients = config::clients_from_env(&args.data_dir, &providers);
            if clients.is_empty() {
                anyhow::bail!("no providers configured; set provider credentials in the environment");
            }
            let summary = SyncJob::new(&args.data_dir, clients).run().await?;
            print!("{summary}");
            println!("{} activities in the canonical collection", summary.total_activities());
        }
        Commands::Rebuild => {
            let exported = rebuild(&args.data_dir)?;
            println!("Rebuilt {exported} track files");
        }
        Commands::List => {
            let store = ActivityStore::open(&args.data_dir)?;
            for activity in store.iter() {
                println!(
                    "{}  {}  {}  {:.1} km",
                    activity.start_time.format("%Y-%m-%d %H:%M"),
                    activity.identity(),
                    activity.sport,
                    activity.distance_meters.unwrap_or_default() / 1000.0,
                );
            }
        }
    }
    Ok(())
}
