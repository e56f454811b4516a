//! In-memory record store reachable through `storage_*` actions

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use relay_core::{Agent, AgentError, CancellationToken, Message, Response};
use serde_json::{Map, Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const SAVE: &str = "storage_save";
pub const GET: &str = "storage_get";
pub const DELETE: &str = "storage_delete";
pub const LIST: &str = "storage_list";
pub const QUERY: &str = "storage_query";

struct Stored {
    seq: u64,
    record: Map<String, Value>,
}

#[derive(Default)]
struct Records {
    next_seq: u64,
    by_id: HashMap<String, Stored>,
}

/// Owns every stored record; other agents reach it only through dispatch
pub struct StorageAgent {
    records: RwLock<Records>,
    max_records: usize,
}

impl StorageAgent {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: RwLock::new(Records::default()),
            max_records,
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.by_id.len()
    }

    async fn save(&self, message: &Message) -> Result<Response> {
        let mut record = match message.payload().get("record") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(AgentError::invalid_field("record", "Record must be a mapping").into()),
            None => return Err(AgentError::invalid_field("record", "Missing 'record' in payload").into()),
        };

        let id = match record.get("id").and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        record.insert("id".to_string(), json!(id));
        if let Some(user) = message.get_str("user_id") {
            record.insert("user_id".to_string(), json!(user));
        }

        let mut records = self.records.write().await;
        if let Some(existing) = records.by_id.get(&id) {
            if !owned_by(&existing.record, message.get_str("user_id")) {
                return Err(AgentError::not_found(format!("Record not found: {}", id)).into());
            }
            // An unscoped update keeps the record's owner
            if let Some(owner) = existing.record.get("user_id") {
                record
                    .entry("user_id")
                    .or_insert_with(|| owner.clone());
            }
        } else if records.by_id.len() >= self.max_records {
            return Err(AgentError::conflict(format!(
                "Storage is full ({} records)",
                self.max_records
            ))
            .into());
        }

        let seq = match records.by_id.get(&id).map(|existing| existing.seq) {
            Some(seq) => seq,
            None => {
                records.next_seq += 1;
                records.next_seq
            }
        };
        records.by_id.insert(
            id.clone(),
            Stored {
                seq,
                record: record.clone(),
            },
        );
        debug!(correlation_id = %message.correlation_id(), "Saved record {}", id);

        Ok(message.reply(json!({ "record": record })))
    }

    async fn get(&self, message: &Message) -> Result<Response> {
        let id = message.require_str("id")?;
        let records = self.records.read().await;
        match records.by_id.get(id) {
            Some(stored) if owned_by(&stored.record, message.get_str("user_id")) => {
                Ok(message.reply(json!({ "record": stored.record })))
            }
            _ => Err(AgentError::not_found(format!("Record not found: {}", id)).into()),
        }
    }

    async fn delete(&self, message: &Message) -> Result<Response> {
        let id = message.require_str("id")?;
        let mut records = self.records.write().await;
        let visible = records
            .by_id
            .get(id)
            .is_some_and(|stored| owned_by(&stored.record, message.get_str("user_id")));
        if !visible {
            return Err(AgentError::not_found(format!("Record not found: {}", id)).into());
        }
        records.by_id.remove(id);
        debug!(correlation_id = %message.correlation_id(), "Deleted record {}", id);
        Ok(message.reply(json!({ "deleted": true, "id": id })))
    }

    async fn query(&self, message: &Message, filter: &Map<String, Value>) -> Result<Response> {
        let user = message.get_str("user_id");
        let records = self.records.read().await;
        let mut matches: Vec<&Stored> = records
            .by_id
            .values()
            .filter(|stored| owned_by(&stored.record, user))
            .filter(|stored| {
                filter
                    .iter()
                    .all(|(field, expected)| stored.record.get(field) == Some(expected))
            })
            .collect();
        matches.sort_by_key(|stored| stored.seq);

        let found: Vec<&Map<String, Value>> = matches.iter().map(|stored| &stored.record).collect();
        Ok(message.reply(json!({ "count": found.len(), "records": found })))
    }
}

/// Records saved with a `user_id` are only visible to that user.
/// Requests without a `user_id` see everything.
fn owned_by(record: &Map<String, Value>, user: Option<&str>) -> bool {
    match user {
        None => true,
        Some(user) => record.get("user_id").and_then(Value::as_str) == Some(user),
    }
}

#[async_trait]
impl Agent for StorageAgent {
    fn name(&self) -> &str {
        "storage_handler"
    }

    fn prefixes(&self) -> Vec<String> {
        vec!["storage".to_string()]
    }

    fn supported_actions(&self) -> Vec<String> {
        [SAVE, GET, DELETE, LIST, QUERY].iter().map(|a| a.to_string()).collect()
    }

    async fn stop(&self) -> Result<()> {
        info!("StorageAgent: stopping with {} records", self.len().await);
        Ok(())
    }

    async fn handle(&self, message: &Message, _cancel: &CancellationToken) -> Result<Response> {
        match message.action() {
            SAVE => self.save(message).await,
            GET => self.get(message).await,
            DELETE => self.delete(message).await,
            LIST => self.query(message, &Map::new()).await,
            QUERY => {
                let filter = match message.payload().get("filter") {
                    None | Some(Value::Null) => Map::new(),
                    Some(Value::Object(filter)) => filter.clone(),
                    Some(_) => {
                        return Err(AgentError::invalid_field("filter", "Filter must be a mapping").into());
                    }
                };
                self.query(message, &filter).await
            }
            other => Err(AgentError::routing(format!("Unknown storage action: {}", other)).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ErrorKind;

    fn msg(action: &str, payload: Value) -> Message {
        Message::new(action, payload).unwrap()
    }

    async fn call(agent: &StorageAgent, action: &str, payload: Value) -> Result<Response> {
        agent.handle(&msg(action, payload), &CancellationToken::new()).await
    }

    fn kind_of(err: anyhow::Error) -> ErrorKind {
        err.downcast_ref::<AgentError>().unwrap().kind()
    }

    #[tokio::test]
    async fn test_save_assigns_id_and_get_returns_it() {
        let agent = StorageAgent::new(10);
        let saved = call(&agent, SAVE, json!({"record": {"title": "Buy milk"}})).await.unwrap();
        let id = saved.data().unwrap()["record"]["id"].as_str().unwrap().to_string();

        let fetched = call(&agent, GET, json!({"id": id})).await.unwrap();
        assert_eq!(fetched.data().unwrap()["record"]["title"], "Buy milk");
        assert_eq!(agent.len().await, 1);
    }

    #[tokio::test]
    async fn test_save_existing_id_updates_in_place() {
        let agent = StorageAgent::new(10);
        call(&agent, SAVE, json!({"record": {"id": "a", "n": 1}})).await.unwrap();
        call(&agent, SAVE, json!({"record": {"id": "a", "n": 2}})).await.unwrap();

        assert_eq!(agent.len().await, 1);
        let fetched = call(&agent, GET, json!({"id": "a"})).await.unwrap();
        assert_eq!(fetched.data().unwrap()["record"]["n"], 2);
    }

    #[tokio::test]
    async fn test_missing_record_is_validation_error() {
        let agent = StorageAgent::new(10);
        let err = call(&agent, SAVE, json!({})).await.unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::Validation);

        let err = call(&agent, SAVE, json!({"record": 5})).await.unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_get_and_delete_unknown_are_not_found() {
        let agent = StorageAgent::new(10);
        let err = call(&agent, GET, json!({"id": "nope"})).await.unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::NotFound);

        let err = call(&agent, DELETE, json!({"id": "nope"})).await.unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let agent = StorageAgent::new(10);
        call(&agent, SAVE, json!({"record": {"id": "a"}})).await.unwrap();
        let deleted = call(&agent, DELETE, json!({"id": "a"})).await.unwrap();
        assert_eq!(deleted.data().unwrap()["deleted"], true);
        assert_eq!(agent.len().await, 0);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let agent = StorageAgent::new(1);
        call(&agent, SAVE, json!({"record": {"id": "a"}})).await.unwrap();
        let err = call(&agent, SAVE, json!({"record": {"id": "b"}})).await.unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::Conflict);

        // Updating an existing record is still allowed when full
        call(&agent, SAVE, json!({"record": {"id": "a", "x": 1}})).await.unwrap();
    }

    #[tokio::test]
    async fn test_query_filters_and_keeps_insertion_order() {
        let agent = StorageAgent::new(10);
        call(&agent, SAVE, json!({"record": {"id": "1", "status": "pending"}})).await.unwrap();
        call(&agent, SAVE, json!({"record": {"id": "2", "status": "completed"}})).await.unwrap();
        call(&agent, SAVE, json!({"record": {"id": "3", "status": "pending"}})).await.unwrap();

        let pending = call(&agent, QUERY, json!({"filter": {"status": "pending"}})).await.unwrap();
        let data = pending.data().unwrap();
        assert_eq!(data["count"], 2);
        assert_eq!(data["records"][0]["id"], "1");
        assert_eq!(data["records"][1]["id"], "3");

        let all = call(&agent, LIST, json!({})).await.unwrap();
        assert_eq!(all.data().unwrap()["count"], 3);
    }

    #[tokio::test]
    async fn test_user_scoping() {
        let agent = StorageAgent::new(10);
        call(&agent, SAVE, json!({"record": {"id": "a"}, "user_id": "alice"})).await.unwrap();
        call(&agent, SAVE, json!({"record": {"id": "b"}, "user_id": "bob"})).await.unwrap();

        let alice = call(&agent, LIST, json!({"user_id": "alice"})).await.unwrap();
        assert_eq!(alice.data().unwrap()["count"], 1);

        let err = call(&agent, GET, json!({"id": "b", "user_id": "alice"})).await.unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::NotFound);

        let err = call(&agent, DELETE, json!({"id": "b", "user_id": "alice"})).await.unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::NotFound);

        // Unscoped callers see everything
        let all = call(&agent, LIST, json!({})).await.unwrap();
        assert_eq!(all.data().unwrap()["count"], 2);
    }

    #[tokio::test]
    async fn test_unscoped_save_keeps_owner() {
        let agent = StorageAgent::new(10);
        call(&agent, SAVE, json!({"record": {"id": "a", "n": 1}, "user_id": "alice"})).await.unwrap();

        let saved = call(&agent, SAVE, json!({"record": {"id": "a", "n": 2}})).await.unwrap();
        assert_eq!(saved.data().unwrap()["record"]["user_id"], "alice");

        let fetched = call(&agent, GET, json!({"id": "a", "user_id": "alice"})).await.unwrap();
        assert_eq!(fetched.data().unwrap()["record"]["n"], 2);
        let listed = call(&agent, LIST, json!({"user_id": "alice"})).await.unwrap();
        assert_eq!(listed.data().unwrap()["count"], 1);
    }

    #[tokio::test]
    async fn test_unknown_storage_verb() {
        let agent = StorageAgent::new(10);
        let err = call(&agent, "storage_clear", json!({})).await.unwrap_err();
        assert_eq!(kind_of(err), ErrorKind::Routing);
    }
}
