use crate::core::config::Config;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static INSTANCE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\*\*instance_id\*\* - (.+)").expect("instance id pattern is valid")
});

/// Identity of a task as written in its statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskIdentity {
    pub instance_id: Option<String>,
    pub repo_id: Option<String>,
}

impl TaskIdentity {
    pub fn is_complete(&self) -> bool {
        self.instance_id.is_some() && self.repo_id.is_some()
    }
}

/// Reads `**instance_id** - <value>` from a task statement.
///
/// The repo id is the instance id up to its last `-`, or the whole id when it
/// has none.
pub fn parse_task_statement(statement: &str) -> TaskIdentity {
    let Some(instance_id) = INSTANCE_ID_RE
        .captures(statement)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|id| !id.is_empty())
    else {
        return TaskIdentity::default();
    };

    let repo_id = match instance_id.rfind('-') {
        Some(idx) => instance_id[..idx].to_string(),
        None => instance_id.clone(),
    };

    TaskIdentity {
        repo_id: Some(repo_id).filter(|r| !r.is_empty()),
        instance_id: Some(instance_id),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverableFolder {
    pub url: String,
    pub repo_id: String,
    pub instance_id: String,
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTask {
    pub task_id: String,
    pub repo_id: Option<String>,
    pub instance_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFolders {
    pub successful_folders: Vec<DeliverableFolder>,
    pub failed_tasks: Vec<FailedTask>,
    pub total_tasks: usize,
}

impl DeliveryFolders {
    pub fn urls(&self) -> Vec<String> {
        self.successful_folders.iter().map(|f| f.url.clone()).collect()
    }
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
struct JobEnvelope {
    result: Option<JobResult>,
}

#[derive(Debug, Deserialize)]
struct JobResult {
    deliverable_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    message: Option<String>,
}

fn id_string(id: Option<&Value>) -> String {
    match id {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "unknown".to_string(),
    }
}

struct ParsedTask {
    task_id: String,
    instance_id: String,
    repo_id: String,
}

/// Looks up the deliverable folders of a delivery batch.
pub struct TaskSource {
    http: reqwest::Client,
    tasks_url: String,
    jobs_url: String,
    jobs_topic: String,
}

impl TaskSource {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            tasks_url: config.tasks_api_url.clone(),
            jobs_url: config.jobs_api_url.clone(),
            jobs_topic: config.jobs_topic.clone(),
        })
    }

    pub async fn fetch_delivery_folders(
        &self,
        batch_id: &str,
        user_token: &str,
    ) -> Result<DeliveryFolders> {
        let rows = self.fetch_task_rows(batch_id, user_token).await?;
        let total_tasks = rows.len();

        let mut parsed = Vec::new();
        let mut failed_tasks = Vec::new();

        // Rows are read field by field so one badly typed field cannot hide
        // the row's id.
        for row in &rows {
            let task = row.get("task");
            let Some(statement) = task
                .and_then(|t| t.get("statement"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
            else {
                failed_tasks.push(FailedTask {
                    task_id: id_string(row.get("id")),
                    repo_id: None,
                    instance_id: None,
                    reason: "Task missing statement data".to_string(),
                });
                continue;
            };

            let task_id = id_string(task.and_then(|t| t.get("id")));
            let identity = parse_task_statement(statement);
            match (identity.instance_id, identity.repo_id) {
                (Some(instance_id), Some(repo_id)) => parsed.push(ParsedTask {
                    task_id,
                    instance_id,
                    repo_id,
                }),
                _ => failed_tasks.push(FailedTask {
                    task_id,
                    repo_id: None,
                    instance_id: None,
                    reason: "Could not parse repo_id or instance_id from task statement"
                        .to_string(),
                }),
            }
        }

        if parsed.is_empty() {
            anyhow::bail!("No valid task information found");
        }
        info!(
            "Batch {}: {} tasks, {} parsed, resolving deliverables",
            batch_id,
            total_tasks,
            parsed.len()
        );

        let mut successful_folders = Vec::new();
        for task in parsed {
            match self.fetch_deliverable_url(&task, user_token).await {
                Ok(url) => successful_folders.push(DeliverableFolder {
                    url,
                    repo_id: task.repo_id,
                    instance_id: task.instance_id,
                    task_id: task.task_id,
                }),
                Err(reason) => {
                    warn!("Task {} has no deliverable: {}", task.task_id, reason);
                    failed_tasks.push(FailedTask {
                        task_id: task.task_id,
                        repo_id: Some(task.repo_id),
                        instance_id: Some(task.instance_id),
                        reason,
                    });
                }
            }
        }

        Ok(DeliveryFolders {
            successful_folders,
            failed_tasks,
            total_tasks,
        })
    }

    async fn fetch_task_rows(&self, batch_id: &str, user_token: &str) -> Result<Vec<Value>> {
        let filter = format!("deliveryBatchId||$eq||{}", batch_id);
        let resp = self
            .http
            .get(&self.tasks_url)
            .bearer_auth(user_token)
            .query(&[
                ("limit", "1000"),
                ("page", "1"),
                ("join[0]", "task"),
                ("filter[0]", filter.as_str()),
                ("join[1]", "task.project"),
                ("join[2]", "task.batch"),
                ("join[3]", "task.currentUser"),
                ("join[4]", "deliveryBatch"),
                ("join[5]", "task.versions"),
            ])
            .send()
            .await
            .context("Failed to fetch tasks")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!(
                "Failed to fetch tasks: {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or_default()
            );
        }

        let body: Value = resp
            .json()
            .await
            .context("Invalid response format from tasks API")?;
        match body.get("data") {
            Some(Value::Array(rows)) => Ok(rows.clone()),
            _ => anyhow::bail!("Invalid response format from tasks API"),
        }
    }

    /// Per-task failures come back as the reason to record, never as `Err`
    /// for the whole batch.
    async fn fetch_deliverable_url(
        &self,
        task: &ParsedTask,
        user_token: &str,
    ) -> std::result::Result<String, String> {
        let resp = self
            .http
            .get(&self.jobs_url)
            .header("Cookie", format!("eval_access_token={}", user_token))
            .query(&[
                ("topic", self.jobs_topic.as_str()),
                ("instance_id", task.instance_id.as_str()),
                ("repo_id", task.repo_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| format!("Network or parsing error: {}", e))?;

        let status = resp.status();
        if !status.is_success() {
            let mut reason = format!(
                "HTTP {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or_default()
            );
            if let Ok(ServiceError {
                message: Some(message),
            }) = resp.json::<ServiceError>().await
            {
                reason = format!("{}: {}", reason, message);
            }
            return Err(format!("Failed to fetch job data - {}", reason));
        }

        let envelope: JobEnvelope = resp
            .json()
            .await
            .map_err(|e| format!("Network or parsing error: {}", e))?;
        debug!("Job lookup for {} succeeded", task.instance_id);

        envelope
            .result
            .and_then(|r| r.deliverable_url)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| "No deliverable_url found in job result".to_string())
    }
}
