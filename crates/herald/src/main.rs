//! Herald: scheduled multi-platform publishing
//!
//! Main binary with subcommands:
//! - `daemon`: Scheduler loop dispatching due jobs
//! - `schedule`: Create a job
//! - `cancel`, `retry`: Act on an existing job
//! - `list`, `show`: Inspect jobs and their attempt timelines

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use herald_scheduler::{JobId, Platform};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod app;
mod commands;
mod config;
mod daemon;

use config::HeraldConfig;

#[derive(Parser)]
#[command(name = "herald")]
#[command(about = "Publish scheduled posts to several platforms", long_about = None)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(long, global = true, env = "HERALD_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory for jobs and attempt logs
    #[arg(long, global = true, env = "HERALD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Connections file
    #[arg(long, global = true, env = "HERALD_CONNECTIONS")]
    connections: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop until Ctrl-C
    Daemon {
        /// Tick interval in seconds (overrides the config file)
        #[arg(long)]
        tick_interval: Option<u64>,
    },

    /// Schedule a post
    Schedule {
        /// Owner of the job
        #[arg(long, env = "HERALD_OWNER")]
        owner: String,

        #[arg(long)]
        title: String,

        /// Body text
        #[arg(long)]
        text: String,

        /// Canonical link appended to social posts
        #[arg(long)]
        link: Option<String>,

        /// Hashtag (repeatable, without '#')
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Target platforms, comma separated
        #[arg(long = "platform", value_delimiter = ',', required = true)]
        platforms: Vec<Platform>,

        /// Publication time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Cancel a job that has not been dispatched
    Cancel { id: JobId },

    /// List jobs, oldest scheduled first
    List {
        #[arg(long)]
        owner: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show a job's targets and attempt timeline
    Show {
        id: JobId,

        #[arg(long)]
        json: bool,
    },

    /// Make retryable targets due immediately
    Retry {
        id: JobId,

        /// Dispatch in this process instead of waiting for the daemon
        #[arg(long)]
        dispatch: bool,
    },
}

impl Cli {
    async fn load_config(&self) -> Result<HeraldConfig> {
        let mut config = HeraldConfig::load(self.config.as_deref())
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(connections) = &self.connections {
            config.connections_path = Some(connections.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "herald=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = cli.load_config().await?;

    match cli.command {
        Commands::Daemon { tick_interval } => {
            if let Some(secs) = tick_interval {
                config.scheduler.tick_interval_secs = secs;
            }
            daemon::run(&config).await?;
        }

        Commands::Schedule {
            owner,
            title,
            text,
            link,
            tags,
            platforms,
            at,
        } => {
            let scheduler = app::open_scheduler(&config).await?;
            commands::schedule(
                &scheduler,
                commands::ScheduleArgs {
                    owner,
                    title,
                    text,
                    link,
                    tags,
                    platforms,
                    at,
                },
            )
            .await?;
        }

        Commands::Cancel { id } => {
            let scheduler = app::open_scheduler(&config).await?;
            commands::cancel(&scheduler, id).await?;
        }

        Commands::List { owner, json } => {
            let scheduler = app::open_scheduler(&config).await?;
            commands::list(&scheduler, owner.as_deref(), json).await?;
        }

        Commands::Show { id, json } => {
            let scheduler = app::open_scheduler(&config).await?;
            commands::show(&scheduler, id, json).await?;
        }

        Commands::Retry { id, dispatch } => {
            let scheduler = app::open_scheduler(&config).await?;
            commands::retry(&scheduler, id, dispatch).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_schedule() {
        let cli = Cli::try_parse_from([
            "herald",
            "--data-dir",
            "/tmp/herald",
            "schedule",
            "--owner",
            "user-1",
            "--title",
            "Launch",
            "--text",
            "We shipped",
            "--tag",
            "rust",
            "--tag",
            "release",
            "--platform",
            "wordpress,bluesky",
            "--at",
            "2026-03-01T09:00:00Z",
        ])
        .unwrap();

        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/herald")));
        let Commands::Schedule {
            owner,
            tags,
            platforms,
            at,
            link,
            ..
        } = cli.command
        else {
            panic!("expected schedule");
        };
        assert_eq!(owner, "user-1");
        assert_eq!(tags, vec!["rust", "release"]);
        assert_eq!(platforms, vec![Platform::Wordpress, Platform::Bluesky]);
        assert_eq!(at.unwrap().to_rfc3339(), "2026-03-01T09:00:00+00:00");
        assert_eq!(link, None);
    }

    #[test]
    fn test_parse_rejects_unknown_platform() {
        let result = Cli::try_parse_from([
            "herald",
            "schedule",
            "--owner",
            "user-1",
            "--title",
            "t",
            "--text",
            "x",
            "--platform",
            "myspace",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_job_id() {
        let id = JobId::new();
        let cli = Cli::try_parse_from(["herald", "retry", &id.to_string(), "--dispatch"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Retry { id: parsed, dispatch: true } if parsed == id
        ));

        assert!(Cli::try_parse_from(["herald", "show", "not-a-uuid"]).is_err());
    }

    #[tokio::test]
    async fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "herald",
            "--data-dir",
            "/srv/herald",
            "--connections",
            "/etc/herald/connections.json",
            "list",
        ])
        .unwrap();
        let config = cli.load_config().await.unwrap();

        assert_eq!(config.jobs_dir(), PathBuf::from("/srv/herald/jobs"));
        assert_eq!(
            config.connections_path(),
            PathBuf::from("/etc/herald/connections.json")
        );
    }
}
