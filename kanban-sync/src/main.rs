//! Kanban sync watcher
//!
//! Attaches to one resource and prints its reconciled view every time it
//! changes. Useful for checking a backend's stream and REST endpoints.
//!
//! Usage:
//!   kanban-sync-watch --token <TOKEN> projects --workspace <ID>
//!   kanban-sync-watch --token <TOKEN> team-issues --team <ID>

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kanban_sync::{ResourceKey, ResourceView, StaticTokenProvider, SyncClient, SyncConfig};
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "kanban-sync-watch")]
#[command(about = "Print the live reconciled view of a kanban resource")]
struct Args {
    /// Access token for the backend
    #[arg(short, long, env = "KANBAN_TOKEN")]
    token: String,

    /// Remote API base URL (forces polling for every resource)
    #[arg(long)]
    api_url: Option<String>,

    /// WebSocket base URL
    #[arg(long)]
    ws_url: Option<String>,

    /// Print entity JSON instead of ids
    #[arg(long)]
    full: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    resource: Resource,
}

#[derive(Subcommand, Debug)]
enum Resource {
    /// Projects of a workspace
    Projects {
        #[arg(long)]
        workspace: Option<String>,
    },
    /// Issues of a team
    TeamIssues {
        #[arg(long)]
        team: String,
    },
    /// Projects of a team
    TeamProjects {
        #[arg(long)]
        team: String,
    },
}

impl Resource {
    fn key(&self) -> Result<ResourceKey> {
        let key = match self {
            Resource::Projects { workspace } => ResourceKey::projects(workspace.clone()),
            Resource::TeamIssues { team } => ResourceKey::team_issues(team.clone())?,
            Resource::TeamProjects { team } => ResourceKey::team_projects(team.clone())?,
        };
        Ok(key)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let mut config = SyncConfig::from_env().context("invalid KANBAN_* environment")?;
    if let Some(url) = args.api_url.clone() {
        config.api_base_url = Some(url);
    }
    if let Some(url) = args.ws_url.clone() {
        config.ws_base_url = url;
    }

    let key = args.resource.key()?;
    let tokens = Arc::new(StaticTokenProvider::new(args.token.clone()));
    let client = SyncClient::new(config, tokens).context("failed to build sync client")?;
    info!("Watching {} over {}", key, client.mode(key.kind()));

    let mut handle = client.resource(key);
    loop {
        tokio::select! {
            changed = handle.changed() => {
                changed.context("feed closed")?;
                print_view(&handle.view(), args.full);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }
    Ok(())
}

fn print_view(view: &ResourceView, full: bool) {
    if view.is_loading {
        return;
    }
    if let Some(error) = &view.error {
        warn!("{}", error);
    }
    println!(
        "-- {} item(s){}",
        view.len(),
        if view.is_connected { "" } else { " (disconnected)" }
    );
    for item in &view.items {
        if full {
            println!("{}", item.as_value());
        } else {
            println!("{}", item.id());
        }
    }
}
