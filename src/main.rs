// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weibo_archiver::config::Config;
use weibo_archiver::db::init_database;
use weibo_archiver::worker::Archiver;

#[derive(Parser)]
#[command(name = "weibo-archiver", about = "Personal Weibo archiver", version)]
struct Cli {
    /// Where downloaded media lands. Overrides DOWNLOAD_DIR.
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,

    /// Where the session transcript HTML is written.
    #[arg(long, global = true, default_value = "transcript.html")]
    transcript: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register an author for polling and archive their profile.
    AddUser { uid: i64 },
    /// Take an author out of the polling rotation.
    DisableUser { uid: i64 },
    /// Run one fetch cycle for one author.
    Fetch { uid: i64 },
    /// Poll every enabled author continuously.
    Watch,
    /// Archive a single post by numeric or short ID.
    FetchPost { id: String },
    /// Drop social edges of one author by friend gender.
    PruneEdges { uid: i64, gender: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,weibo_archiver=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(dir) = &cli.download_dir {
        config.media.download_dir = dir.clone();
    }
    info!("Initialized configuration");

    let db = Arc::new(init_database(&config.database).await?);
    info!("Connected to database");

    let mut archiver = Archiver::new(db, config)?;

    let title = match &cli.command {
        Command::AddUser { uid } => format!("add-user {uid}"),
        Command::DisableUser { uid } => format!("disable-user {uid}"),
        Command::Fetch { uid } => format!("fetch {uid}"),
        Command::Watch => "watch".to_string(),
        Command::FetchPost { id } => format!("fetch-post {id}"),
        Command::PruneEdges { uid, gender } => format!("prune-edges {uid} {gender}"),
    };

    let outcome = match cli.command {
        Command::AddUser { uid } => archiver.add_user(uid).await.map(|_| ()),
        Command::DisableUser { uid } => archiver.disable_user(uid).await.map(|changed| {
            if changed {
                info!(uid, "author disabled");
            } else {
                warn!(uid, "no fetch cursor for that author");
            }
        }),
        Command::Fetch { uid } => archiver.fetch_author(uid).await,
        Command::Watch => archiver.watch(&cli.transcript).await,
        Command::FetchPost { id } => archiver.fetch_single_post(&id).await,
        Command::PruneEdges { uid, gender } => archiver
            .prune_edges(uid, &gender)
            .await
            .map(|removed| info!(removed, "edges pruned")),
    };

    // The transcript is the audit surface; it is written whether the
    // command finished or died.
    if let Err(e) = archiver.transcript.write_html(&cli.transcript, &title) {
        error!(path = %cli.transcript.display(), error = %e, "failed to write transcript");
    } else {
        info!(path = %cli.transcript.display(), entries = archiver.transcript.entries().len(),
              "transcript written");
    }

    outcome?;
    Ok(())
}
