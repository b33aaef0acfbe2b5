mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use samop_storage::StateStore;
use samop_sync::{build_scheduler, build_workflow, RawParams, StringOrList, SyncConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "samop-cli")]
#[command(about = "SAM.gov opportunity pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one fetch and print the response JSON.
    Fetch(FetchArgs),
    /// Serve the JSON API.
    Serve,
    /// Run the cron-scheduled fetch until interrupted.
    Schedule,
    /// Rotate state snapshots and list what remains.
    Snapshots {
        #[arg(long, default_value_t = samop_storage::SNAPSHOT_KEEP)]
        keep: usize,
    },
}

#[derive(Debug, Default, Args)]
struct FetchArgs {
    /// NAICS partition code; repeat for several.
    #[arg(long = "naics")]
    naics: Vec<String>,
    #[arg(long = "psc")]
    psc: Vec<String>,
    #[arg(long = "notice-type")]
    notice_types: Vec<String>,
    /// Two-letter state code.
    #[arg(long)]
    place: Option<String>,
    #[arg(long)]
    days_back: Option<i64>,
    #[arg(long)]
    limit: Option<i64>,
    /// Comma-separated keywords.
    #[arg(long)]
    keywords: Option<String>,
    #[arg(long)]
    small_business_only: bool,
    #[arg(long)]
    clear_cache: bool,
    /// MM/DD/YYYY or YYYY-MM-DD.
    #[arg(long)]
    posted_from: Option<String>,
    #[arg(long)]
    posted_to: Option<String>,
}

impl FetchArgs {
    fn into_raw(self) -> RawParams {
        RawParams {
            naics_override: (!self.naics.is_empty()).then_some(self.naics),
            psc_override: (!self.psc.is_empty()).then_some(self.psc),
            notice_type: (!self.notice_types.is_empty()).then_some(StringOrList::Many(self.notice_types)),
            place: self.place,
            days_back: self.days_back,
            limit: self.limit,
            keywords: self.keywords.map(StringOrList::One),
            small_business_only: self.small_business_only.then_some(true),
            clear_cache: self.clear_cache.then_some(true),
            posted_from: self.posted_from,
            posted_to: self.posted_to,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    logging::init_logging(&config.log_level);

    match cli.command.unwrap_or(Commands::Fetch(FetchArgs::default())) {
        Commands::Fetch(args) => {
            let workflow = build_workflow(&config)?;
            let response = workflow.run(args.into_raw()).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&response).context("serializing response")?
            );
            if !response.success {
                std::process::exit(1);
            }
        }
        Commands::Serve => {
            samop_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let workflow = Arc::new(build_workflow(&config)?);
            let mut sched = build_scheduler(workflow, &config.sync_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Snapshots { keep } => {
            let store = StateStore::new(config.state_dir.clone());
            let deleted = store.rotate(keep).await?;
            let remaining = store.list_snapshots().await?;
            println!("deleted={deleted} remaining={}", remaining.len());
            for path in remaining {
                println!("{}", path.display());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch_args(argv: &[&str]) -> FetchArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Some(Commands::Fetch(args)) => args,
            other => panic!("expected fetch, got {other:?}"),
        }
    }

    #[test]
    fn fetch_flags_map_onto_invocation_params() {
        let raw = fetch_args(&[
            "samop-cli",
            "fetch",
            "--naics",
            "541511",
            "--naics",
            "541512",
            "--place",
            "va",
            "--keywords",
            "cloud,cyber",
            "--small-business-only",
            "--days-back",
            "14",
        ])
        .into_raw();
        assert_eq!(raw.naics_override, Some(vec!["541511".to_string(), "541512".to_string()]));
        assert_eq!(raw.place.as_deref(), Some("va"));
        assert_eq!(raw.keywords, Some(StringOrList::One("cloud,cyber".into())));
        assert_eq!(raw.small_business_only, Some(true));
        assert_eq!(raw.days_back, Some(14));
        assert!(raw.clear_cache.is_none());
        assert!(raw.psc_override.is_none());
    }

    #[test]
    fn bare_fetch_leaves_everything_to_defaults() {
        assert_eq!(fetch_args(&["samop-cli", "fetch"]).into_raw(), RawParams::default());
    }

    #[test]
    fn snapshots_keep_defaults_to_ten() {
        let cli = Cli::try_parse_from(["samop-cli", "snapshots"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Snapshots { keep: 10 })));
    }
}
