//! Role storage seam
//!
//! Persistence of roles lives outside this crate. [`RoleStore`] is the
//! interface it must offer, [`InMemoryRoleStore`] is a reference
//! implementation for tests and the demo binary, and
//! [`InvalidatingRoleStore`] adds the read-your-writes guarantee on top of
//! any store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::{CacheInvalidationHook, RoleDraft, RoleRecord, StoreError};

#[async_trait]
pub trait RoleStore: Send + Sync {
    /// Fetch the role for a user; `Ok(None)` when none is assigned
    async fn get(&self, user_id: &str) -> Result<Option<RoleRecord>, StoreError>;

    async fn create(&self, draft: RoleDraft) -> Result<RoleRecord, StoreError>;

    async fn update(&self, draft: RoleDraft) -> Result<RoleRecord, StoreError>;

    async fn delete(&self, user_id: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: RoleStore + ?Sized> RoleStore for Arc<S> {
    async fn get(&self, user_id: &str) -> Result<Option<RoleRecord>, StoreError> {
        (**self).get(user_id).await
    }

    async fn create(&self, draft: RoleDraft) -> Result<RoleRecord, StoreError> {
        (**self).create(draft).await
    }

    async fn update(&self, draft: RoleDraft) -> Result<RoleRecord, StoreError> {
        (**self).update(draft).await
    }

    async fn delete(&self, user_id: &str) -> Result<(), StoreError> {
        (**self).delete(user_id).await
    }
}

/// Role store backed by a map
#[derive(Default)]
pub struct InMemoryRoleStore {
    roles: RwLock<HashMap<String, RoleRecord>>,
}

impl InMemoryRoleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.roles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.roles.read().await.is_empty()
    }
}

#[async_trait]
impl RoleStore for InMemoryRoleStore {
    async fn get(&self, user_id: &str) -> Result<Option<RoleRecord>, StoreError> {
        Ok(self.roles.read().await.get(user_id).cloned())
    }

    async fn create(&self, draft: RoleDraft) -> Result<RoleRecord, StoreError> {
        let record = draft.validate()?;
        let mut roles = self.roles.write().await;
        if roles.contains_key(record.user_id()) {
            return Err(StoreError::AlreadyExists(record.user_id().to_string()));
        }
        roles.insert(record.user_id().to_string(), record.clone());
        Ok(record)
    }

    async fn update(&self, draft: RoleDraft) -> Result<RoleRecord, StoreError> {
        let record = draft.validate()?;
        let mut roles = self.roles.write().await;
        match roles.get_mut(record.user_id()) {
            Some(existing) => {
                *existing = record.clone();
                Ok(record)
            }
            None => Err(StoreError::NotFound(record.user_id().to_string())),
        }
    }

    async fn delete(&self, user_id: &str) -> Result<(), StoreError> {
        self.roles
            .write()
            .await
            .remove(user_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))
    }
}

/// Wraps a store so that every mutation invalidates caches
/// before the mutation returns
///
/// Failed mutations still invalidate: a failure may have partially applied
/// in the backing store, and an extra miss is harmless.
pub struct InvalidatingRoleStore<S> {
    inner: S,
    hook: Arc<dyn CacheInvalidationHook>,
}

impl<S: RoleStore> InvalidatingRoleStore<S> {
    pub fn new(inner: S, hook: Arc<dyn CacheInvalidationHook>) -> Self {
        Self { inner, hook }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: RoleStore> RoleStore for InvalidatingRoleStore<S> {
    async fn get(&self, user_id: &str) -> Result<Option<RoleRecord>, StoreError> {
        self.inner.get(user_id).await
    }

    async fn create(&self, draft: RoleDraft) -> Result<RoleRecord, StoreError> {
        let user_id = draft.user_id.clone();
        let result = self.inner.create(draft).await;
        self.hook.invalidate(&user_id).await;
        if result.is_ok() {
            info!(user_id = %user_id, operation = "create", "Role mutated");
        }
        result
    }

    async fn update(&self, draft: RoleDraft) -> Result<RoleRecord, StoreError> {
        let user_id = draft.user_id.clone();
        let result = self.inner.update(draft).await;
        self.hook.invalidate(&user_id).await;
        if result.is_ok() {
            info!(user_id = %user_id, operation = "update", "Role mutated");
        }
        result
    }

    async fn delete(&self, user_id: &str) -> Result<(), StoreError> {
        let result = self.inner.delete(user_id).await;
        self.hook.invalidate(user_id).await;
        if result.is_ok() {
            info!(user_id = %user_id, operation = "delete", "Role mutated");
        }
        result
    }
}
