//! Live mapping from registered handle to the session that owns it.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::session::Outbox;

pub type SessionId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handle '{0}' is already registered")]
    HandleTaken(String),
}

/// Handles are unique: the membership check and the insert happen under one
/// lock, so two sessions racing for the same name cannot both succeed.
///
/// Entries hold an [`Outbox`] clone, never the session itself. Each session
/// removes its own entry when it closes.
pub struct Registry {
    members: Mutex<HashMap<String, Member>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
struct Member {
    session: SessionId,
    outbox: Outbox,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register(
        &self,
        handle: &str,
        session: SessionId,
        outbox: Outbox,
    ) -> Result<(), RegistryError> {
        let mut members = self.members.lock().await;
        if members.contains_key(handle) {
            return Err(RegistryError::HandleTaken(handle.to_string()));
        }
        members.insert(handle.to_string(), Member { session, outbox });
        Ok(())
    }

    /// Removes `handle` if it still belongs to `session`.
    pub async fn deregister(&self, handle: &str, session: SessionId) -> bool {
        let mut members = self.members.lock().await;
        match members.get(handle) {
            Some(member) if member.session == session => {
                members.remove(handle);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, handle: &str) -> Option<Outbox> {
        let members = self.members.lock().await;
        members.get(handle).map(|member| member.outbox.clone())
    }

    /// Snapshot of every registered outbox.
    ///
    /// The lock is released before the caller writes, so a slow peer never
    /// blocks registration.
    pub async fn recipients(&self) -> Vec<(String, Outbox)> {
        let members = self.members.lock().await;
        members
            .iter()
            .map(|(handle, member)| (handle.clone(), member.outbox.clone()))
            .collect()
    }

    pub async fn handles(&self) -> Vec<String> {
        let members = self.members.lock().await;
        let mut handles: Vec<String> = members.keys().cloned().collect();
        handles.sort();
        handles
    }

    pub async fn contains(&self, handle: &str) -> bool {
        self.members.lock().await.contains_key(handle)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn outbox() -> Outbox {
        let (writer, _reader) = tokio::io::duplex(64);
        Outbox::new(writer)
    }

    #[tokio::test]
    async fn rejects_duplicate_handles() {
        let registry = Registry::new();
        let first = registry.next_id();
        registry
            .register("alice", first, outbox())
            .await
            .expect("first registration should pass");

        let second = registry.next_id();
        let result = registry.register("alice", second, outbox()).await;
        assert_eq!(result, Err(RegistryError::HandleTaken("alice".into())));
    }

    #[tokio::test]
    async fn concurrent_registration_admits_one_session() {
        let registry = Arc::new(Registry::new());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let id = registry.next_id();
                registry.register("carol", id, outbox()).await.is_ok()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(registry.handles().await, vec!["carol"]);
    }

    #[tokio::test]
    async fn deregister_only_removes_own_entry() {
        let registry = Registry::new();
        let owner = registry.next_id();
        let stranger = registry.next_id();
        registry
            .register("bob", owner, outbox())
            .await
            .expect("register");

        assert!(!registry.deregister("bob", stranger).await);
        assert!(registry.contains("bob").await);

        assert!(registry.deregister("bob", owner).await);
        assert!(registry.lookup("bob").await.is_none());

        let next = registry.next_id();
        assert!(registry.register("bob", next, outbox()).await.is_ok());
    }

    #[tokio::test]
    async fn recipients_lists_every_member() {
        let registry = Registry::new();
        for handle in ["a", "b", "c"] {
            let id = registry.next_id();
            registry.register(handle, id, outbox()).await.expect("register");
        }
        let mut handles: Vec<String> = registry
            .recipients()
            .await
            .into_iter()
            .map(|(handle, _)| handle)
            .collect();
        handles.sort();
        assert_eq!(handles, vec!["a", "b", "c"]);
    }
}
