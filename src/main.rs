use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use delivery_ops::coordinator::{Coordinator, JobStatus, JobStore};
use delivery_ops::core::config::{self, Config, SETTING_KEYS};
use delivery_ops::db;
use delivery_ops::logging;
use delivery_ops::services::credentials::{
    CredentialProvider, StoredCredentials, TokenPrompt, acquire_token,
};
use delivery_ops::services::drive::DriveConnector;
use delivery_ops::services::tasks::TaskSource;
use delivery_ops::utils::lock_mutex;
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Parser)]
#[command(name = "delivery-ops")]
#[command(about = "Copy delivery batch folders into your Google Drive")]
struct Cli {
    /// Directory holding the state database and log file
    #[arg(long)]
    state_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the deliverable folders of a batch
    Folders {
        #[arg(long)]
        batch_id: String,
        /// Reviewer token for the delivery APIs
        #[arg(long, env = "DELIVERY_USER_TOKEN")]
        user_token: String,
        /// Print the raw result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Copy every deliverable folder of a batch into one batch folder
    Copy {
        #[arg(long)]
        batch_id: String,
        #[arg(long, env = "DELIVERY_USER_TOKEN")]
        user_token: String,
        /// Use this Drive token instead of the cached one
        #[arg(long)]
        drive_token: Option<String>,
    },
    /// Revoke and forget the cached Drive token
    Logout,
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print every setting
    Show,
    /// Change one setting
    Set { key: String, value: String },
}

struct StdinPrompt;

impl TokenPrompt for StdinPrompt {
    fn prompt(&self) -> Result<Option<String>> {
        eprint!("Paste a Google Drive access token (empty to cancel): ");
        std::io::stderr().flush()?;
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("Failed to read token from stdin")?;
        let token = line.trim();
        Ok((!token.is_empty()).then(|| token.to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(|| Config::default().state_dir);
    std::fs::create_dir_all(&state_dir)?;

    let (_guard, log_handle) = logging::init(Path::new(&state_dir));
    tracing::info!("Starting delivery-ops...");

    let conn = db::init_db(&state_dir)?;
    if !db::has_settings(&conn)? {
        let defaults = Config {
            state_dir: state_dir.clone(),
            ..Config::default()
        };
        config::save_config_to_db(&conn, &defaults)?;
    }

    let cfg = config::load_config_from_db(&conn)?;
    logging::apply_level(&log_handle, &cfg.log_level);
    let conn = Arc::new(StdMutex::new(conn));

    match cli.command {
        Commands::Folders {
            batch_id,
            user_token,
            json,
        } => list_folders(&cfg, &batch_id, &user_token, json).await,
        Commands::Copy {
            batch_id,
            user_token,
            drive_token,
        } => copy_batch(conn, cfg, &batch_id, &user_token, drive_token).await,
        Commands::Logout => {
            let creds = StoredCredentials::new(conn, &cfg, None)?;
            creds.revoke().await?;
            println!("Signed out of Google Drive.");
            Ok(())
        }
        Commands::Config(ConfigCommand::Show) => show_config(&cfg),
        Commands::Config(ConfigCommand::Set { key, value }) => {
            let mut cfg = cfg;
            cfg.set_field(&key, &value)?;
            cfg.validate()?;
            config::save_config_to_db(&*lock_mutex(&conn)?, &cfg)?;
            if key == "log_level" {
                logging::apply_level(&log_handle, &cfg.log_level);
            }
            println!("{} = {}", key, value);
            Ok(())
        }
    }
}

async fn list_folders(cfg: &Config, batch_id: &str, user_token: &str, json: bool) -> Result<()> {
    let source = TaskSource::new(cfg)?;
    let folders = source.fetch_delivery_folders(batch_id, user_token).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&folders)?);
        return Ok(());
    }

    println!(
        "Batch {}: {} tasks, {} folders, {} failed",
        batch_id,
        folders.total_tasks,
        folders.successful_folders.len(),
        folders.failed_tasks.len()
    );
    for folder in &folders.successful_folders {
        println!("  {}  {}  (task {})", folder.instance_id, folder.url, folder.task_id);
    }
    for task in &folders.failed_tasks {
        println!("  ! task {}: {}", task.task_id, task.reason);
    }
    Ok(())
}

async fn copy_batch(
    conn: Arc<StdMutex<rusqlite::Connection>>,
    cfg: Config,
    batch_id: &str,
    user_token: &str,
    drive_token: Option<String>,
) -> Result<()> {
    cfg.validate()?;

    let folders = TaskSource::new(&cfg)?
        .fetch_delivery_folders(batch_id, user_token)
        .await?;
    for task in &folders.failed_tasks {
        eprintln!("Skipping task {}: {}", task.task_id, task.reason);
    }
    if folders.successful_folders.is_empty() {
        anyhow::bail!("No deliverable folders found for batch {}", batch_id);
    }

    let creds = StoredCredentials::new(conn, &cfg, Some(Box::new(StdinPrompt)))?;
    let token = match drive_token {
        Some(token) => {
            creds.accept(&token).await?;
            token.trim().to_string()
        }
        None => acquire_token(&creds).await?,
    };

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let coordinator = Coordinator::new(
        Arc::new(JobStore::default()),
        Arc::new(DriveConnector::new(&cfg)?),
        Arc::new(AsyncMutex::new(cfg)),
        Some(tx),
    );

    let job = coordinator.create_job(batch_id, folders.urls(), &token)?;
    println!("Job {}: copying {} folders", job.id, job.total_folders);
    let handle = coordinator.spawn_job(job.id);
    drop(coordinator);

    while let Some(update) = rx.recv().await {
        println!("[{:>5.1}%] {}", update.progress, update.message);
    }

    let job = handle.await.context("Copy job panicked")??;
    if let Some(results) = &job.results
        && !results.errors.is_empty()
    {
        println!("{} problems:", results.errors.len());
        for error in &results.errors {
            println!("  - {}", error);
        }
    }
    if let Some(id) = &job.batch_folder_id {
        println!("Batch folder: https://drive.google.com/drive/folders/{}", id);
    }

    match job.status {
        JobStatus::Completed => Ok(()),
        _ => anyhow::bail!(
            "Copy job {} {}: {}",
            job.id,
            job.status.as_str(),
            job.error.unwrap_or_default()
        ),
    }
}

fn show_config(cfg: &Config) -> Result<()> {
    let values = serde_json::to_value(cfg)?;
    for key in SETTING_KEYS {
        let value = match values.get(*key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => "(unset)".to_string(),
            Some(other) => other.to_string(),
        };
        println!("{:<24} {}", key, value);
    }
    Ok(())
}
