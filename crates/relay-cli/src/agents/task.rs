//! Todo task agent. Persists through the storage agent via dispatch.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{
    Agent, AgentError, CancellationToken, DispatchHandle, ErrorInfo, ErrorKind, Message, Response,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::storage;

pub const ADD: &str = "task_add";
pub const GET: &str = "task_get";
pub const LIST: &str = "task_list";
pub const UPDATE: &str = "task_update";
pub const COMPLETE: &str = "task_complete";
pub const DELETE: &str = "task_delete";

const MAX_TITLE_CHARS: usize = 200;
const MAX_DESCRIPTION_CHARS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(title: &str, description: Option<&str>) -> Result<Self, AgentError> {
        let now = Utc::now();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: clean_title(title)?,
            description: clean_description(description)?,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    /// Returns false if the task was already completed
    pub fn mark_complete(&mut self) -> bool {
        if self.status == TaskStatus::Completed {
            return false;
        }
        let now = Utc::now();
        self.status = TaskStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
        true
    }

    fn to_record(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(AgentError::internal("Task did not serialize to a record").into()),
        }
    }

    fn from_record(record: &Value) -> Result<Self> {
        Ok(serde_json::from_value(record.clone())?)
    }
}

fn clean_title(title: &str) -> Result<String, AgentError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(AgentError::invalid_field("title", "Title must not be empty"));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(AgentError::invalid_field(
            "title",
            format!("Title must be at most {} characters", MAX_TITLE_CHARS),
        ));
    }
    Ok(title.to_string())
}

fn clean_description(description: Option<&str>) -> Result<Option<String>, AgentError> {
    let Some(description) = description.map(str::trim).filter(|d| !d.is_empty()) else {
        return Ok(None);
    };
    if description.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(AgentError::invalid_field(
            "description",
            format!("Description must be at most {} characters", MAX_DESCRIPTION_CHARS),
        ));
    }
    Ok(Some(description.to_string()))
}

/// Rebuild a typed error from a failed storage response so it keeps its kind
fn error_from_info(info: &ErrorInfo) -> AgentError {
    let message = info.message.clone();
    match info.kind {
        ErrorKind::Validation => AgentError::Validation {
            message,
            field: None,
        },
        ErrorKind::NotFound => AgentError::NotFound(message),
        ErrorKind::Authorization => AgentError::Authorization(message),
        ErrorKind::Conflict => AgentError::Conflict(message),
        ErrorKind::Internal => AgentError::Internal(message),
        ErrorKind::Routing => AgentError::Routing(message),
        ErrorKind::Timeout => AgentError::Timeout(message),
    }
}

pub struct TaskAgent {
    orchestrator: DispatchHandle,
}

impl TaskAgent {
    pub fn new(orchestrator: DispatchHandle) -> Self {
        Self { orchestrator }
    }

    /// Dispatch a storage action on behalf of `message`, keeping its correlation id
    async fn storage(&self, message: &Message, action: &str, mut payload: Map<String, Value>) -> Result<Map<String, Value>> {
        if let Some(user) = message.get_str("user_id") {
            payload.insert("user_id".to_string(), json!(user));
        }
        let request = message.follow_up(action, Value::Object(payload))?;
        let response = self.orchestrator.dispatch(request).await;
        if let Some(info) = response.error_info() {
            debug!(
                correlation_id = %message.correlation_id(),
                "TaskAgent: {} failed: {}", action, info
            );
            return Err(error_from_info(info).into());
        }
        Ok(response.into_data().unwrap_or_default())
    }

    async fn load(&self, message: &Message) -> Result<Task> {
        let id = message.require_str("id")?;
        let mut payload = Map::new();
        payload.insert("id".to_string(), json!(id));
        let data = self.storage(message, storage::GET, payload).await?;
        Task::from_record(data.get("record").unwrap_or(&Value::Null))
    }

    async fn save(&self, message: &Message, task: &Task) -> Result<()> {
        let mut payload = Map::new();
        payload.insert("record".to_string(), Value::Object(task.to_record()?));
        self.storage(message, storage::SAVE, payload).await?;
        Ok(())
    }

    async fn add(&self, message: &Message) -> Result<Response> {
        let title = message.require_str("title")?;
        let task = Task::new(title, message.get_str("description"))?;
        self.save(message, &task).await?;
        info!(correlation_id = %message.correlation_id(), "TaskAgent: added task {}", task.id);
        Ok(message.reply(json!({ "task": task })))
    }

    async fn get(&self, message: &Message) -> Result<Response> {
        let task = self.load(message).await?;
        Ok(message.reply(json!({ "task": task })))
    }

    async fn list(&self, message: &Message) -> Result<Response> {
        let mut filter = Map::new();
        match message.get_str("status").unwrap_or("all") {
            "all" => {}
            status @ ("pending" | "completed") => {
                filter.insert("status".to_string(), json!(status));
            }
            other => {
                return Err(AgentError::invalid_field(
                    "status",
                    format!("Invalid status filter '{}'. Expected pending, completed or all", other),
                )
                .into());
            }
        }

        let mut payload = Map::new();
        payload.insert("filter".to_string(), Value::Object(filter));
        let data = self.storage(message, storage::QUERY, payload).await?;

        let tasks = match data.get("records") {
            Some(Value::Array(records)) => records
                .iter()
                .map(Task::from_record)
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::new(),
        };
        Ok(message.reply(json!({ "count": tasks.len(), "tasks": tasks })))
    }

    async fn update(&self, message: &Message) -> Result<Response> {
        let title = message.get_str("title");
        let description = message.get_str("description");
        if title.is_none() && description.is_none() {
            return Err(AgentError::validation("Nothing to update: provide 'title' or 'description'").into());
        }

        let mut task = self.load(message).await?;
        if let Some(title) = title {
            task.title = clean_title(title)?;
        }
        if description.is_some() {
            task.description = clean_description(description)?;
        }
        task.updated_at = Utc::now();
        self.save(message, &task).await?;
        Ok(message.reply(json!({ "task": task })))
    }

    async fn complete(&self, message: &Message) -> Result<Response> {
        let mut task = self.load(message).await?;
        if task.mark_complete() {
            self.save(message, &task).await?;
            info!(correlation_id = %message.correlation_id(), "TaskAgent: completed task {}", task.id);
        }
        Ok(message.reply(json!({ "task": task })))
    }

    async fn delete(&self, message: &Message) -> Result<Response> {
        let id = message.require_str("id")?;
        let mut payload = Map::new();
        payload.insert("id".to_string(), json!(id));
        self.storage(message, storage::DELETE, payload).await?;
        Ok(message.reply(json!({ "deleted": true, "id": id })))
    }
}

#[async_trait]
impl Agent for TaskAgent {
    fn name(&self) -> &str {
        "task_manager"
    }

    fn prefixes(&self) -> Vec<String> {
        vec!["task".to_string()]
    }

    fn supported_actions(&self) -> Vec<String> {
        [ADD, GET, LIST, UPDATE, COMPLETE, DELETE]
            .iter()
            .map(|a| a.to_string())
            .collect()
    }

    async fn handle(&self, message: &Message, _cancel: &CancellationToken) -> Result<Response> {
        match message.action() {
            ADD => self.add(message).await,
            GET => self.get(message).await,
            LIST => self.list(message).await,
            UPDATE => self.update(message).await,
            COMPLETE => self.complete(message).await,
            DELETE => self.delete(message).await,
            other => Err(AgentError::routing(format!("Unknown task action: {}", other)).into()),
        }
    }
}
