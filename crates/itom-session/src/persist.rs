//! Ordered write-through of chat messages to the conversation store.
//!
//! One worker task drains a queue, so messages reach the backend in the
//! order the session produced them. A conversation the backend has never
//! seen is created on the first 404 and the backend-assigned id is reported
//! back to the session.

use std::collections::HashMap;
use std::sync::Arc;

use itom_core::ConversationId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::{ConversationStore, NewConversation, NewMessage};

const TITLE_CHARS: usize = 60;

/// The backend created `local` under its own id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Adopted {
    pub local: ConversationId,
    pub remote: ConversationId,
}

struct Job {
    conversation_id: ConversationId,
    message: NewMessage,
}

/// Queue handle; the worker stops once every handle is dropped.
pub(crate) struct Persister {
    jobs: mpsc::UnboundedSender<Job>,
}

impl Persister {
    pub(crate) fn spawn(
        store: Arc<dyn ConversationStore>,
    ) -> (Self, mpsc::UnboundedReceiver<Adopted>) {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (adopted_tx, adopted_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            store,
            remote_ids: HashMap::new(),
            adopted: adopted_tx,
        };
        tokio::spawn(worker.run(jobs_rx));
        (Self { jobs: jobs_tx }, adopted_rx)
    }

    pub(crate) fn enqueue(&self, conversation_id: ConversationId, message: NewMessage) {
        let job = Job {
            conversation_id,
            message,
        };
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
            warn!(conversation_id = %job.conversation_id, "persistence worker gone, message dropped");
        }
    }
}

struct Worker {
    store: Arc<dyn ConversationStore>,
    /// Local conversation id -> id the backend assigned on create.
    remote_ids: HashMap<ConversationId, ConversationId>,
    adopted: mpsc::UnboundedSender<Adopted>,
}

impl Worker {
    async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = jobs.recv().await {
            if let Err(e) = self.write(&job).await {
                warn!(
                    conversation_id = %job.conversation_id,
                    code = e.code(),
                    error = %e,
                    "failed to persist message"
                );
            }
        }
        debug!("persistence worker stopped");
    }

    async fn write(&mut self, job: &Job) -> Result<(), StoreError> {
        let mapped = self.remote_ids.get(&job.conversation_id).cloned();
        let target = mapped.clone().unwrap_or_else(|| job.conversation_id.clone());

        match self.store.append_message(target.as_str(), &job.message).await {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) if mapped.is_none() => {
                let remote = self.create(job).await?;
                self.store.append_message(remote.as_str(), &job.message).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn create(&mut self, job: &Job) -> Result<ConversationId, StoreError> {
        let created = self
            .store
            .create(&NewConversation {
                title: title_from(&job.message.content),
                ..NewConversation::default()
            })
            .await?;
        let remote = ConversationId::from(created.id);
        info!(
            local = %job.conversation_id,
            remote = %remote,
            "conversation created on backend"
        );
        self.remote_ids
            .insert(job.conversation_id.clone(), remote.clone());
        let _ = self.adopted.send(Adopted {
            local: job.conversation_id.clone(),
            remote: remote.clone(),
        });
        Ok(remote)
    }
}

/// First 60 characters of the opening message, with an ellipsis when cut.
fn title_from(content: &str) -> String {
    let mut title: String = content.chars().take(TITLE_CHARS).collect();
    if content.chars().count() > TITLE_CHARS {
        title.push_str("...");
    }
    title
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::export::ExportFormat;
    use crate::store::{
        ConversationRecord, ConversationSummary, ExportedConversation, StoredMessage,
    };

    /// Knows only the conversations it created; appends elsewhere are 404s.
    #[derive(Default)]
    struct BackendStore {
        known: Mutex<Vec<String>>,
        created: Mutex<Vec<String>>,
        appended: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ConversationStore for BackendStore {
        async fn list(&self) -> Result<Vec<ConversationSummary>, StoreError> {
            Ok(Vec::new())
        }

        async fn create(
            &self,
            request: &NewConversation,
        ) -> Result<ConversationSummary, StoreError> {
            let id = format!("srv-{}", self.known.lock().unwrap().len() + 1);
            self.known.lock().unwrap().push(id.clone());
            self.created.lock().unwrap().push(request.title.clone());
            Ok(ConversationSummary {
                id,
                title: request.title.clone(),
                created_at: String::new(),
                updated_at: String::new(),
                message_count: None,
                last_message: None,
            })
        }

        async fn search(&self, _query: &str) -> Result<Vec<ConversationSummary>, StoreError> {
            Ok(Vec::new())
        }

        async fn get(&self, id: &str) -> Result<ConversationRecord, StoreError> {
            Err(StoreError::NotFound(id.to_string()))
        }

        async fn delete(&self, _id: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn append_message(
            &self,
            id: &str,
            message: &NewMessage,
        ) -> Result<StoredMessage, StoreError> {
            if !self.known.lock().unwrap().iter().any(|k| k == id) {
                return Err(StoreError::NotFound(id.to_string()));
            }
            // Yield mid-write so out-of-order workers would interleave.
            tokio::task::yield_now().await;
            self.appended
                .lock()
                .unwrap()
                .push((id.to_string(), message.content.clone()));
            Ok(StoredMessage {
                id: "m".into(),
                conversation_id: id.to_string(),
                role: message.role.clone(),
                content: message.content.clone(),
                created_at: String::new(),
                agent_id: None,
                metadata: Value::Null,
            })
        }

        async fn export(
            &self,
            id: &str,
            _format: ExportFormat,
        ) -> Result<ExportedConversation, StoreError> {
            Err(StoreError::NotFound(id.to_string()))
        }
    }

    fn body(content: &str) -> NewMessage {
        NewMessage {
            role: "user".into(),
            content: content.into(),
            agent_id: None,
            metadata: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn unknown_conversation_is_created_once_and_adopted() {
        let store = Arc::new(BackendStore::default());
        let (persister, mut adopted) = Persister::spawn(store.clone());
        let local = ConversationId::from("local-1");

        for content in ["first", "second", "third"] {
            persister.enqueue(local.clone(), body(content));
        }

        let update = adopted.recv().await.unwrap();
        assert_eq!(update.local, local);
        assert_eq!(update.remote.as_str(), "srv-1");

        drop(persister);
        // Channel closes once the worker has drained the queue and exited.
        assert!(adopted.recv().await.is_none());

        assert_eq!(*store.created.lock().unwrap(), ["first"]);
        assert_eq!(
            *store.appended.lock().unwrap(),
            [
                ("srv-1".to_string(), "first".to_string()),
                ("srv-1".to_string(), "second".to_string()),
                ("srv-1".to_string(), "third".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn existing_conversation_is_not_recreated() {
        let store = Arc::new(BackendStore::default());
        store.known.lock().unwrap().push("C7".into());
        let (persister, mut adopted) = Persister::spawn(store.clone());

        persister.enqueue(ConversationId::from("C7"), body("hello"));
        drop(persister);

        assert!(adopted.recv().await.is_none());
        assert!(store.created.lock().unwrap().is_empty());
        assert_eq!(
            *store.appended.lock().unwrap(),
            [("C7".to_string(), "hello".to_string())]
        );
    }

    #[test]
    fn long_openers_are_cut_for_the_title() {
        assert_eq!(title_from("short"), "short");
        let long = "x".repeat(70);
        assert_eq!(title_from(&long), format!("{}...", "x".repeat(60)));
    }
}
