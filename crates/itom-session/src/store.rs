use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use itom_core::config::CONVERSATIONS_PATH;
use itom_core::{Message, Role};
use itom_protocol::decode_list;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::export::ExportFormat;

type StoreResult<T> = std::result::Result<T, StoreError>;

/// Row in the conversation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub message_count: Option<u64>,
    #[serde(default)]
    pub last_message: Option<String>,
}

/// A persisted message as the backend returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    #[serde(default)]
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl StoredMessage {
    /// Convert into a history entry. Unknown roles yield `None`.
    ///
    /// Artifacts and suggested actions saved in `metadata` are restored;
    /// malformed items are skipped one by one.
    pub fn into_message(self) -> Option<Message> {
        let role: Role = self.role.parse().ok()?;
        let mut message = Message::new(role, self.content)
            .with_id(self.id)
            .with_agent(self.agent_id.filter(|a| !a.is_empty()));
        if let Some(ts) = parse_timestamp(&self.created_at) {
            message.created_at = ts;
        }
        message.artifacts = decode_list(&self.metadata, "artifacts");
        message.suggested_actions = decode_list(&self.metadata, "suggested_actions");
        Some(message)
    }
}

/// A conversation with its full message list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NewConversation {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub metadata: serde_json::Map<String, Value>,
}

impl From<&Message> for NewMessage {
    fn from(message: &Message) -> Self {
        let mut metadata = serde_json::Map::new();
        if !message.artifacts.is_empty() {
            if let Ok(artifacts) = serde_json::to_value(&message.artifacts) {
                metadata.insert("artifacts".into(), artifacts);
            }
        }
        if !message.suggested_actions.is_empty() {
            if let Ok(actions) = serde_json::to_value(&message.suggested_actions) {
                metadata.insert("suggested_actions".into(), actions);
            }
        }
        Self {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
            agent_id: message.agent_id.clone(),
            metadata,
        }
    }
}

/// Server-side export result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExportedConversation {
    pub conversation_id: String,
    pub format: String,
    pub content_type: String,
    pub content: String,
}

/// Conversation CRUD backend.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn list(&self) -> StoreResult<Vec<ConversationSummary>>;
    async fn create(&self, request: &NewConversation) -> StoreResult<ConversationSummary>;
    async fn search(&self, query: &str) -> StoreResult<Vec<ConversationSummary>>;
    async fn get(&self, id: &str) -> StoreResult<ConversationRecord>;
    async fn delete(&self, id: &str) -> StoreResult<()>;
    async fn append_message(&self, id: &str, message: &NewMessage) -> StoreResult<StoredMessage>;
    async fn export(&self, id: &str, format: ExportFormat) -> StoreResult<ExportedConversation>;
}

/// reqwest client for the backend's `/api/conversations` routes.
pub struct HttpConversationStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpConversationStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}{}{}", self.base_url, CONVERSATIONS_PATH, suffix)
    }
}

/// Map non-2xx statuses to [`StoreError`]; 404 becomes `NotFound(id)`.
pub(crate) async fn check(resp: reqwest::Response, id: &str) -> StoreResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(StoreError::NotFound(id.to_string()));
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("detail").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or_default().to_string());
    Err(StoreError::Http {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ConversationStore for HttpConversationStore {
    #[instrument(skip(self))]
    async fn list(&self) -> StoreResult<Vec<ConversationSummary>> {
        let resp = self.client.get(self.url("")).send().await?;
        let resp = check(resp, "").await?;
        Ok(resp.json().await?)
    }

    #[instrument(skip(self, request), fields(title = %request.title))]
    async fn create(&self, request: &NewConversation) -> StoreResult<ConversationSummary> {
        let resp = self.client.post(self.url("")).json(request).send().await?;
        let resp = check(resp, "").await?;
        let created: ConversationSummary = resp.json().await?;
        debug!(id = %created.id, "conversation created");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn search(&self, query: &str) -> StoreResult<Vec<ConversationSummary>> {
        let resp = self
            .client
            .get(self.url("/search"))
            .query(&[("q", query)])
            .send()
            .await?;
        let resp = check(resp, "").await?;
        Ok(resp.json().await?)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> StoreResult<ConversationRecord> {
        let resp = self.client.get(self.url(&format!("/{id}"))).send().await?;
        let resp = check(resp, id).await?;
        Ok(resp.json().await?)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> StoreResult<()> {
        let resp = self.client.delete(self.url(&format!("/{id}"))).send().await?;
        check(resp, id).await?;
        Ok(())
    }

    #[instrument(skip(self, message), fields(role = %message.role))]
    async fn append_message(&self, id: &str, message: &NewMessage) -> StoreResult<StoredMessage> {
        let resp = self
            .client
            .post(self.url(&format!("/{id}/messages")))
            .json(message)
            .send()
            .await?;
        let resp = check(resp, id).await?;
        Ok(resp.json().await?)
    }

    #[instrument(skip(self))]
    async fn export(&self, id: &str, format: ExportFormat) -> StoreResult<ExportedConversation> {
        let resp = self
            .client
            .get(self.url(&format!("/{id}/export")))
            .query(&[("format", format.as_str())])
            .send()
            .await?;
        let resp = check(resp, id).await?;
        Ok(resp.json().await?)
    }
}

/// Backend timestamps are ISO-8601, with or without an offset.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use itom_core::ArtifactType;

    #[test]
    fn stored_message_converts_with_server_id_and_time() {
        let stored: StoredMessage = serde_json::from_value(serde_json::json!({
            "id": "m-9",
            "conversation_id": "C1",
            "role": "assistant",
            "content": "Found 42 servers",
            "created_at": "2026-01-01T10:00:00",
            "agent_id": "cmdb-agent",
            "metadata": {}
        }))
        .unwrap();
        let msg = stored.into_message().unwrap();
        assert_eq!(msg.id.as_str(), "m-9");
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.agent_id.as_deref(), Some("cmdb-agent"));
        assert_eq!(msg.created_at.to_rfc3339(), "2026-01-01T10:00:00+00:00");
    }

    #[test]
    fn stored_message_with_unknown_role_is_skipped() {
        let stored = StoredMessage {
            id: "m".into(),
            conversation_id: "C1".into(),
            role: "tool".into(),
            content: "x".into(),
            created_at: String::new(),
            agent_id: None,
            metadata: Value::Null,
        };
        assert!(stored.into_message().is_none());
    }

    #[test]
    fn stored_metadata_restores_artifacts_and_actions() {
        let stored: StoredMessage = serde_json::from_value(serde_json::json!({
            "id": "m-3",
            "conversation_id": "C1",
            "role": "assistant",
            "content": "| host | os |\n|---|---|\n| web-01 | linux |",
            "created_at": "2026-01-01T10:00:00Z",
            "agent_id": "cmdb-agent",
            "metadata": {
                "artifacts": [
                    {"artifact_id": "a1", "artifact_type": "table", "title": "Servers",
                     "content": {"rows": 1}},
                    {"artifact_id": "a2", "artifact_type": "hologram"}
                ],
                "suggested_actions": [
                    {"label": "Impact", "prompt": "/impact web-01", "agent_target": "cmdb-agent"}
                ]
            }
        }))
        .unwrap();
        let msg = stored.into_message().unwrap();
        assert_eq!(msg.artifacts.len(), 1);
        assert_eq!(msg.artifacts[0].artifact_id, "a1");
        assert_eq!(msg.artifacts[0].artifact_type, ArtifactType::Table);
        assert_eq!(msg.suggested_actions.len(), 1);
        assert_eq!(msg.suggested_actions[0].prompt, "/impact web-01");
    }

    #[test]
    fn null_metadata_yields_no_artifacts() {
        let stored = StoredMessage {
            id: "m".into(),
            conversation_id: "C1".into(),
            role: "assistant".into(),
            content: "plain".into(),
            created_at: String::new(),
            agent_id: None,
            metadata: Value::Null,
        };
        let msg = stored.into_message().unwrap();
        assert!(msg.artifacts.is_empty());
        assert!(msg.suggested_actions.is_empty());
    }

    #[test]
    fn summary_tolerates_missing_counts() {
        let summary: ConversationSummary =
            serde_json::from_str(r#"{"id":"C1","title":"Servers","created_at":"x","updated_at":"y"}"#)
                .unwrap();
        assert!(summary.message_count.is_none());
    }

    #[test]
    fn new_message_body_shape() {
        let msg = Message::user("hello");
        let json = serde_json::to_value(NewMessage::from(&msg)).unwrap();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "hello", "metadata": {}}));
    }

    #[test]
    fn urls_are_built_under_conversations_path() {
        let store = HttpConversationStore::new("http://chat.local/");
        assert_eq!(store.url("/C1/export"), "http://chat.local/api/conversations/C1/export");
    }
}
