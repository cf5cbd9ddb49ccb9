//! Pullwatch CLI - command-line front end for the sync engine.

mod config;

use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use console::Term;
use tracing_subscriber::EnvFilter;

use pullwatch::store::{self, SharedStore};
use pullwatch::sync::{sync_all, ProgressCallback, SyncContext, SyncEvent};
use pullwatch::{Api, ApiRateLimiter, ReqwestTransport, Store};

#[derive(Parser)]
#[command(name = "pullwatch")]
#[command(version)]
#[command(about = "Track pull requests and issues across GitHub-style servers")]
#[command(
    long_about = "Pullwatch incrementally synchronizes pull requests, issues and their \
comments, labels and statuses from one or more GitHub-style API servers into \
a local store, honoring rate limits and per-endpoint backoff."
)]
#[command(after_long_help = r#"CONFIGURATION
    Pullwatch reads configuration from:
      1. ~/.config/pullwatch/config.toml (or $XDG_CONFIG_HOME/pullwatch/config.toml)
      2. ./pullwatch.toml
      3. Environment variables (PULLWATCH_* prefix)
      4. .env file in current directory

ENVIRONMENT VARIABLES
    PULLWATCH_GITHUB_TOKEN    Token for the default github.com server when no
                              servers are configured
"#)]
struct Cli {
    /// Print progress events while syncing
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync cycle against every configured server
    Sync,
    /// Show the rate budget of every configured server
    Limits,
}

fn build_store(servers: Vec<pullwatch::Server>) -> SharedStore {
    let mut store = Store::new();
    for server in servers {
        store.add_server(server);
    }
    store::shared(store)
}

fn progress_printer() -> Arc<ProgressCallback> {
    let callback: ProgressCallback = Box::new(|event: SyncEvent| match event {
        SyncEvent::RefreshStarted => eprintln!("refresh started"),
        SyncEvent::RefreshEnded { success } => {
            eprintln!("refresh ended ({})", if success { "ok" } else { "failed" });
        }
        SyncEvent::ApiUsage {
            remaining, limit, ..
        } => eprintln!("rate budget: {remaining}/{limit}"),
        SyncEvent::ReposMarkedDirty { count } => eprintln!("{count} repos marked dirty"),
        SyncEvent::NewRepo { repo_id } => eprintln!("new repository {repo_id}"),
        SyncEvent::ItemMerged { item_id } => eprintln!("item {item_id} was merged"),
        SyncEvent::ItemClosed { item_id } => eprintln!("item {item_id} was closed"),
        SyncEvent::NewAssignment { item_id } => eprintln!("item {item_id} assigned to you"),
        _ => {}
    });
    Arc::new(callback)
}

async fn handle_sync(
    config: &config::Config,
    store: SharedStore,
    verbose: bool,
) -> Result<bool, Box<dyn std::error::Error>> {
    let settings = config.settings()?;
    let transport = ReqwestTransport::with_defaults()?;

    let mut builder = SyncContext::builder()
        .transport(transport)
        .store(Arc::clone(&store))
        .settings(settings);
    if config.sync.rate_limit_rps > 0 {
        builder = builder.limiter(ApiRateLimiter::new(config.sync.rate_limit_rps));
    }
    if verbose {
        builder = builder.progress(progress_printer());
    }
    let ctx = Arc::new(builder.build()?);

    let success = sync_all(&ctx).await;

    {
        let store = store::lock(&store);
        let repos = store.repos().count();
        let items = store.items().count();
        println!("{repos} repositories, {items} items tracked");
        for server in store.servers() {
            let state = if server.last_sync_succeeded { "ok" } else { "failed" };
            println!("  {}: {}", server.label, state);
        }
    }
    println!("{}", ctx.refresh_status(Utc::now()));

    Ok(success)
}

async fn handle_limits(store: SharedStore) -> Result<(), Box<dyn std::error::Error>> {
    let transport = ReqwestTransport::with_defaults()?;
    let api = Api::new(transport, Arc::clone(&store));

    let server_ids = { store::lock(&store).good_server_ids() };
    for server_id in server_ids {
        if let Err(e) = api.refresh_rate_limit(server_id).await {
            tracing::warn!(%server_id, error = %e, "could not refresh rate limit");
        }
        let store = store::lock(&store);
        if let Some(server) = store.server(server_id) {
            let remaining = server
                .requests_remaining
                .map_or("?".to_string(), |v| v.to_string());
            let limit = server
                .requests_limit
                .map_or("?".to_string(), |v| v.to_string());
            let reset = server
                .reset_at
                .map_or("?".to_string(), |t| t.to_rfc3339());
            println!("{}: {remaining}/{limit} (resets {reset})", server.label);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Structured logging when not attached to a terminal.
    if !Term::stdout().is_term() {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pullwatch=info,pullwatch_cli=info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    let config = config::Config::load();
    let cli = Cli::parse();

    let servers = config.servers();
    if servers.iter().all(|s| s.auth_token.is_none()) {
        eprintln!(
            "no server tokens configured; add [[servers]] entries to {} or set PULLWATCH_GITHUB_TOKEN",
            config::Config::default_config_path()
                .map_or("./pullwatch.toml".to_string(), |p| p.display().to_string())
        );
        std::process::exit(2);
    }
    let store = build_store(servers);

    match cli.command {
        Commands::Sync => {
            let success = handle_sync(&config, store, cli.verbose).await?;
            if !success {
                std::process::exit(1);
            }
        }
        Commands::Limits => {
            handle_limits(store).await?;
        }
    }

    Ok(())
}
