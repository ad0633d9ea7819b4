use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Remote endpoints
    pub drive_api_base: String,
    pub revoke_url: String,
    pub tasks_api_url: String,
    pub jobs_api_url: String,
    pub jobs_topic: String,

    // Destination
    pub batch_folder_prefix: String,
    /// Parent of the batch folder. `None` creates it at the Drive root.
    pub destination_parent_id: Option<String>,

    // Copy fan-out
    pub file_batch_size: usize,
    pub subfolder_batch_size: usize,
    pub folder_batch_size: usize,
    pub max_in_flight_requests: usize,
    pub list_page_size: u32,
}

fn default_state_dir() -> String {
    "./state".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            log_level: default_log_level(),
            drive_api_base: "https://www.googleapis.com/drive/v3".to_string(),
            revoke_url: "https://accounts.google.com/o/oauth2/revoke".to_string(),
            tasks_api_url: "https://eval.turing.com/api/delivery/tasks".to_string(),
            jobs_api_url: "https://swe-bench-plus.turing.com/api/jobs/get".to_string(),
            jobs_topic: "run_pipeline_msft".to_string(),
            batch_folder_prefix: "Delivery_Batch_".to_string(),
            destination_parent_id: None,
            file_batch_size: 10,
            subfolder_batch_size: 3,
            folder_batch_size: 5,
            max_in_flight_requests: 16,
            list_page_size: 1000,
        }
    }
}

// --- Database-backed config ---

use crate::db;
use rusqlite::Connection;

pub fn load_config_from_db(conn: &Connection) -> Result<Config> {
    let settings = db::load_all_settings(conn)?;
    let defaults = Config::default();

    let get =
        |key: &str| -> Option<String> { settings.get(key).cloned().filter(|s| !s.is_empty()) };

    let get_or = |key: &str, default: &str| -> String {
        get(key).unwrap_or_else(|| default.to_string())
    };

    let get_usize = |key: &str, default: usize| -> usize {
        settings
            .get(key)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    };

    Ok(Config {
        state_dir: get_or("state_dir", &defaults.state_dir),
        log_level: get_or("log_level", &defaults.log_level),
        drive_api_base: get_or("drive_api_base", &defaults.drive_api_base),
        revoke_url: get_or("revoke_url", &defaults.revoke_url),
        tasks_api_url: get_or("tasks_api_url", &defaults.tasks_api_url),
        jobs_api_url: get_or("jobs_api_url", &defaults.jobs_api_url),
        jobs_topic: get_or("jobs_topic", &defaults.jobs_topic),
        batch_folder_prefix: get_or("batch_folder_prefix", &defaults.batch_folder_prefix),
        destination_parent_id: get("destination_parent_id"),
        file_batch_size: get_usize("file_batch_size", defaults.file_batch_size),
        subfolder_batch_size: get_usize("subfolder_batch_size", defaults.subfolder_batch_size),
        folder_batch_size: get_usize("folder_batch_size", defaults.folder_batch_size),
        max_in_flight_requests: get_usize(
            "max_in_flight_requests",
            defaults.max_in_flight_requests,
        ),
        list_page_size: settings
            .get("list_page_size")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.list_page_size),
    })
}

pub fn save_config_to_db(conn: &Connection, cfg: &Config) -> Result<()> {
    db::set_setting(conn, "state_dir", &cfg.state_dir)?;
    db::set_setting(conn, "log_level", &cfg.log_level)?;
    db::set_setting(conn, "drive_api_base", &cfg.drive_api_base)?;
    db::set_setting(conn, "revoke_url", &cfg.revoke_url)?;
    db::set_setting(conn, "tasks_api_url", &cfg.tasks_api_url)?;
    db::set_setting(conn, "jobs_api_url", &cfg.jobs_api_url)?;
    db::set_setting(conn, "jobs_topic", &cfg.jobs_topic)?;
    db::set_setting(conn, "batch_folder_prefix", &cfg.batch_folder_prefix)?;
    db::set_setting(
        conn,
        "destination_parent_id",
        cfg.destination_parent_id.as_deref().unwrap_or(""),
    )?;
    db::set_setting(conn, "file_batch_size", &cfg.file_batch_size.to_string())?;
    db::set_setting(
        conn,
        "subfolder_batch_size",
        &cfg.subfolder_batch_size.to_string(),
    )?;
    db::set_setting(conn, "folder_batch_size", &cfg.folder_batch_size.to_string())?;
    db::set_setting(
        conn,
        "max_in_flight_requests",
        &cfg.max_in_flight_requests.to_string(),
    )?;
    db::set_setting(conn, "list_page_size", &cfg.list_page_size.to_string())?;
    Ok(())
}

/// Known setting keys, in display order.
pub const SETTING_KEYS: &[&str] = &[
    "state_dir",
    "log_level",
    "drive_api_base",
    "revoke_url",
    "tasks_api_url",
    "jobs_api_url",
    "jobs_topic",
    "batch_folder_prefix",
    "destination_parent_id",
    "file_batch_size",
    "subfolder_batch_size",
    "folder_batch_size",
    "max_in_flight_requests",
    "list_page_size",
];

impl Config {
    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.file_batch_size == 0 {
            anyhow::bail!("file_batch_size must be > 0");
        }
        if self.subfolder_batch_size == 0 {
            anyhow::bail!("subfolder_batch_size must be > 0");
        }
        if self.folder_batch_size == 0 {
            anyhow::bail!("folder_batch_size must be > 0");
        }
        if self.max_in_flight_requests == 0 {
            anyhow::bail!("max_in_flight_requests must be > 0");
        }

        // Drive caps pageSize at 1000
        if self.list_page_size == 0 || self.list_page_size > 1000 {
            anyhow::bail!("list_page_size must be between 1 and 1000");
        }

        for (name, value) in [
            ("drive_api_base", &self.drive_api_base),
            ("tasks_api_url", &self.tasks_api_url),
            ("jobs_api_url", &self.jobs_api_url),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{} must not be empty", name);
            }
        }

        Ok(())
    }

    /// Sets one field from its setting key, as used by `config set`.
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<()> {
        let parse_usize = |v: &str| -> Result<usize> {
            v.parse()
                .map_err(|_| anyhow::anyhow!("{} expects a positive integer, got '{}'", key, v))
        };

        match key {
            "state_dir" => self.state_dir = value.to_string(),
            "log_level" => self.log_level = value.to_string(),
            "drive_api_base" => self.drive_api_base = value.trim_end_matches('/').to_string(),
            "revoke_url" => self.revoke_url = value.to_string(),
            "tasks_api_url" => self.tasks_api_url = value.to_string(),
            "jobs_api_url" => self.jobs_api_url = value.to_string(),
            "jobs_topic" => self.jobs_topic = value.to_string(),
            "batch_folder_prefix" => self.batch_folder_prefix = value.to_string(),
            "destination_parent_id" => {
                self.destination_parent_id =
                    Some(value.trim().to_string()).filter(|v| !v.is_empty())
            }
            "file_batch_size" => self.file_batch_size = parse_usize(value)?,
            "subfolder_batch_size" => self.subfolder_batch_size = parse_usize(value)?,
            "folder_batch_size" => self.folder_batch_size = parse_usize(value)?,
            "max_in_flight_requests" => self.max_in_flight_requests = parse_usize(value)?,
            "list_page_size" => {
                self.list_page_size = value.parse().map_err(|_| {
                    anyhow::anyhow!("list_page_size expects an integer, got '{}'", value)
                })?
            }
            other => anyhow::bail!("Unknown setting: {}", other),
        }
        Ok(())
    }
}
