//! Repo lifecycle bookkeeping (§4.2): the `{did, head, status, ...}` record a storage
//! back-end needs in order to answer `load_repo`/`create_repo`/`deactivate_repo`/etc,
//! kept separate from the MST mirror in [`crate::repo::Repo`] because it's metadata
//! about a repo, not content addressed by it.

use crate::error::RepoError;
use crate::types::{AtpRepo, RepoStatus};
use anyhow::Result;
use async_trait::async_trait;
use lexicon_cid::Cid;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait RepoRegistry: Send + Sync {
    async fn create_repo(&self, repo: AtpRepo) -> Result<()>;

    /// Resolves a DID or handle to its repo metadata. Per §4.2/§7, a `tombstoned`
    /// repo is rejected with [`RepoError::InactiveRepo`] unless `allow_inactive` is
    /// set; a `deactivated` repo is always returned (read-only sync is allowed, see
    /// the Open Questions in §9).
    async fn load_repo(&self, did_or_handle: &str, allow_inactive: bool) -> Result<AtpRepo>;

    async fn update_head(&self, did: &str, head: Cid, rev: String) -> Result<()>;
    async fn deactivate_repo(&self, did: &str) -> Result<()>;
    async fn activate_repo(&self, did: &str) -> Result<()>;
    async fn tombstone_repo(&self, did: &str) -> Result<()>;
}

/// In-memory reference implementation; the durable back-end keeps the same rows in a
/// real table but answers the same trait.
#[derive(Debug, Default)]
pub struct InMemoryRepoRegistry {
    by_did: RwLock<HashMap<String, AtpRepo>>,
    handle_index: RwLock<HashMap<String, String>>,
}

impl InMemoryRepoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolve_did(&self, did_or_handle: &str) -> Result<String, RepoError> {
        if self.by_did.read().await.contains_key(did_or_handle) {
            return Ok(did_or_handle.to_string());
        }
        self.handle_index
            .read()
            .await
            .get(did_or_handle)
            .cloned()
            .ok_or_else(|| RepoError::RepoNotFound(did_or_handle.to_string()))
    }
}

#[async_trait]
impl RepoRegistry for InMemoryRepoRegistry {
    async fn create_repo(&self, repo: AtpRepo) -> Result<()> {
        if let Some(handle) = &repo.handle {
            self.handle_index
                .write()
                .await
                .insert(handle.clone(), repo.did.clone());
        }
        self.by_did.write().await.insert(repo.did.clone(), repo);
        Ok(())
    }

    async fn load_repo(&self, did_or_handle: &str, allow_inactive: bool) -> Result<AtpRepo> {
        let did = self.resolve_did(did_or_handle).await?;
        let guard = self.by_did.read().await;
        let repo = guard
            .get(&did)
            .cloned()
            .ok_or_else(|| RepoError::RepoNotFound(did_or_handle.to_string()))?;
        if repo.status == RepoStatus::Tombstoned && !allow_inactive {
            return Err(RepoError::InactiveRepo(did).into());
        }
        Ok(repo)
    }

    async fn update_head(&self, did: &str, head: Cid, rev: String) -> Result<()> {
        let mut guard = self.by_did.write().await;
        let repo = guard
            .get_mut(did)
            .ok_or_else(|| RepoError::RepoNotFound(did.to_string()))?;
        repo.head = head;
        repo.rev = rev;
        Ok(())
    }

    async fn deactivate_repo(&self, did: &str) -> Result<()> {
        let mut guard = self.by_did.write().await;
        let repo = guard
            .get_mut(did)
            .ok_or_else(|| RepoError::RepoNotFound(did.to_string()))?;
        repo.status = RepoStatus::Deactivated;
        Ok(())
    }

    async fn activate_repo(&self, did: &str) -> Result<()> {
        let mut guard = self.by_did.write().await;
        let repo = guard
            .get_mut(did)
            .ok_or_else(|| RepoError::RepoNotFound(did.to_string()))?;
        if repo.status == RepoStatus::Tombstoned {
            return Err(RepoError::InactiveRepo(did.to_string()).into());
        }
        repo.status = RepoStatus::Active;
        Ok(())
    }

    async fn tombstone_repo(&self, did: &str) -> Result<()> {
        let mut guard = self.by_did.write().await;
        let repo = guard
            .get_mut(did)
            .ok_or_else(|| RepoError::RepoNotFound(did.to_string()))?;
        repo.status = RepoStatus::Tombstoned;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_repo(did: &str) -> AtpRepo {
        AtpRepo {
            did: did.to_string(),
            head: Cid::default(),
            rev: "3kabcxyz".to_string(),
            signing_key: "did:key:zDummy".to_string(),
            rotation_key: None,
            handle: Some(format!("{did}.test")),
            status: RepoStatus::Active,
            created_at: "1970-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[tokio::test]
    async fn resolves_by_did_and_by_handle() {
        let registry = InMemoryRepoRegistry::new();
        registry.create_repo(sample_repo("did:plc:a")).await.unwrap();

        let by_did = registry.load_repo("did:plc:a", false).await.unwrap();
        let by_handle = registry.load_repo("did:plc:a.test", false).await.unwrap();
        assert_eq!(by_did.did, by_handle.did);
    }

    #[tokio::test]
    async fn tombstoned_repo_rejects_load_unless_allowed() {
        let registry = InMemoryRepoRegistry::new();
        registry.create_repo(sample_repo("did:plc:a")).await.unwrap();
        registry.tombstone_repo("did:plc:a").await.unwrap();

        assert!(registry.load_repo("did:plc:a", false).await.is_err());
        assert!(registry.load_repo("did:plc:a", true).await.is_ok());
    }

    #[tokio::test]
    async fn deactivated_repo_loads_normally() {
        let registry = InMemoryRepoRegistry::new();
        registry.create_repo(sample_repo("did:plc:a")).await.unwrap();
        registry.deactivate_repo("did:plc:a").await.unwrap();

        let repo = registry.load_repo("did:plc:a", false).await.unwrap();
        assert_eq!(repo.status, RepoStatus::Deactivated);
    }

    #[tokio::test]
    async fn tombstoned_repo_cannot_be_reactivated() {
        let registry = InMemoryRepoRegistry::new();
        registry.create_repo(sample_repo("did:plc:a")).await.unwrap();
        registry.tombstone_repo("did:plc:a").await.unwrap();
        assert!(registry.activate_repo("did:plc:a").await.is_err());
    }
}
