//! Notebook mutations guarded against double submission.
//!
//! Creating is keyed per owner and rejects a second click while the first is in
//! flight. Deleting is keyed per notebook and idempotent: a repeat delete, or one
//! that finds the row already gone, is reported as success.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::GateError;
use crate::guard::{GuardPolicy, MutationGuard, PendingOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notebook {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookDraft {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

fn default_title() -> String { "Untitled notebook".to_string() }

impl Default for NotebookDraft {
    fn default() -> Self { Self { title: default_title(), description: String::new() } }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    Other(String),
}

impl StoreError {
    fn into_gate(self, id: &str) -> GateError {
        match self {
            StoreError::NotFound => GateError::ResourceNotFound { id: id.to_string() },
            StoreError::Other(m) => GateError::store(m),
        }
    }
}

pub trait ResourceStore: Send + Sync {
    fn create<'a>(&'a self, owner_id: &'a str, draft: NotebookDraft) -> BoxFuture<'a, Result<Notebook, StoreError>>;
    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;
    /// Most recently updated first.
    fn list<'a>(&'a self, owner_id: &'a str) -> BoxFuture<'a, Result<Vec<Notebook>, StoreError>>;
}

pub struct NotebookService {
    store: Arc<dyn ResourceStore>,
    creates: MutationGuard<Notebook>,
    deletes: MutationGuard<()>,
}

fn create_key(owner_id: &str) -> String { format!("create:{}", owner_id) }

impl NotebookService {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store, creates: MutationGuard::new("notebook_create"), deletes: MutationGuard::new("notebook_delete") }
    }

    pub fn create(&self, owner_id: &str, draft: NotebookDraft) -> PendingOutcome<Notebook> {
        let store = self.store.clone();
        let owner = owner_id.to_string();
        self.creates.run(create_key(owner_id), GuardPolicy::Reject, move || async move {
            let notebook = store.create(&owner, draft).await.map_err(|e| e.into_gate(&owner))?;
            info!(target: "classgate::guard", "created notebook id={} owner={}", notebook.id, owner);
            Ok(notebook)
        })
    }

    pub fn delete(&self, notebook_id: &str) -> PendingOutcome<()> {
        let store = self.store.clone();
        let id = notebook_id.to_string();
        self.deletes.run(notebook_id, GuardPolicy::IdempotentSucceed, move || async move {
            match store.delete(&id).await {
                Ok(()) => {
                    info!(target: "classgate::guard", "deleted notebook id={}", id);
                    Ok(())
                }
                Err(StoreError::NotFound) => {
                    debug!(target: "classgate::guard", "notebook id={} already gone", id);
                    Ok(())
                }
                Err(e) => Err(e.into_gate(&id)),
            }
        })
    }

    pub async fn list(&self, owner_id: &str) -> Result<Vec<Notebook>, GateError> {
        self.store.list(owner_id).await.map_err(|e| e.into_gate(owner_id))
    }

    pub fn is_creating(&self, owner_id: &str) -> bool { self.creates.is_in_flight(&create_key(owner_id)) }

    pub fn is_deleting(&self, notebook_id: &str) -> bool { self.deletes.is_in_flight(notebook_id) }

    pub fn create_guard(&self) -> &MutationGuard<Notebook> { &self.creates }

    pub fn delete_guard(&self) -> &MutationGuard<()> { &self.deletes }
}
