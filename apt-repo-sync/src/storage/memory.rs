// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! In-memory storage. */

use {
    crate::{
        content::RepositoryVersion,
        error::{RepoSyncError, Result},
        io::ContentDigest,
        storage::{ArtifactStore, RepositoryStore},
    },
    async_trait::async_trait,
    std::collections::HashMap,
    tokio::sync::RwLock,
};

/// An [ArtifactStore] holding content in memory.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    blobs: RwLock<HashMap<ContentDigest, Vec<u8>>>,
}

impl MemoryArtifactStore {
    /// The number of distinct blobs held.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    /// Whether no blobs are held.
    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    /// Replace stored content without any checks. Only useful to simulate corruption.
    pub async fn overwrite(&self, digest: &ContentDigest, data: Vec<u8>) {
        self.blobs.write().await.insert(digest.clone(), data);
    }

    /// Drop stored content.
    pub async fn remove(&self, digest: &ContentDigest) -> Option<Vec<u8>> {
        self.blobs.write().await.remove(digest)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn exists(&self, digest: &ContentDigest) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(digest))
    }

    async fn get(&self, digest: &ContentDigest) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(digest)
            .cloned()
            .ok_or_else(|| RepoSyncError::ArtifactNotFound(digest.to_string()))
    }

    async fn put(&self, digest: &ContentDigest, data: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .await
            .entry(digest.clone())
            .or_insert_with(|| data.to_vec());

        Ok(())
    }
}

/// A [RepositoryStore] holding versions in memory.
#[derive(Debug, Default)]
pub struct MemoryRepositoryStore {
    repositories: RwLock<HashMap<String, Vec<RepositoryVersion>>>,
}

#[async_trait]
impl RepositoryStore for MemoryRepositoryStore {
    async fn latest_version(&self, repository: &str) -> Result<Option<RepositoryVersion>> {
        Ok(self
            .repositories
            .read()
            .await
            .get(repository)
            .and_then(|versions| versions.last().cloned()))
    }

    async fn version(&self, repository: &str, number: u64) -> Result<RepositoryVersion> {
        self.repositories
            .read()
            .await
            .get(repository)
            .and_then(|versions| versions.iter().find(|v| v.number == number).cloned())
            .ok_or_else(|| RepoSyncError::UnknownRepositoryVersion(repository.to_string(), number))
    }

    async fn create_version(&self, version: &RepositoryVersion) -> Result<()> {
        let mut repositories = self.repositories.write().await;
        let versions = repositories
            .entry(version.repository.clone())
            .or_default();

        let latest = versions.last().map(|v| v.number);
        if version.number != latest.unwrap_or(0) + 1 {
            return Err(RepoSyncError::VersionConflict {
                repository: version.repository.clone(),
                expected: version.number.checked_sub(1).filter(|n| *n > 0),
                actual: latest,
            });
        }

        versions.push(version.clone());

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{content::VersionOrigin, io::ChecksumType},
        chrono::Utc,
    };

    fn version(number: u64) -> RepositoryVersion {
        RepositoryVersion {
            repository: "repo".into(),
            number,
            created: Utc::now(),
            units: Default::default(),
            origin: VersionOrigin::default(),
        }
    }

    #[tokio::test]
    async fn artifact_put_is_idempotent() -> Result<()> {
        let store = MemoryArtifactStore::default();
        let digest = ChecksumType::Sha256.digest_data(b"content");

        assert!(!store.exists(&digest).await?);
        assert!(matches!(
            store.get(&digest).await,
            Err(RepoSyncError::ArtifactNotFound(_))
        ));

        store.put(&digest, b"content").await?;
        store.put(&digest, b"content").await?;
        assert!(store.exists(&digest).await?);
        assert_eq!(store.get(&digest).await?, b"content");
        assert_eq!(store.len().await, 1);

        Ok(())
    }

    #[tokio::test]
    async fn versions_are_ordered() -> Result<()> {
        let store = MemoryRepositoryStore::default();
        assert!(store.latest_version("repo").await?.is_none());

        assert!(matches!(
            store.create_version(&version(2)).await,
            Err(RepoSyncError::VersionConflict { .. })
        ));

        store.create_version(&version(1)).await?;
        store.create_version(&version(2)).await?;
        assert!(store.create_version(&version(2)).await.is_err());

        assert_eq!(store.latest_version("repo").await?.unwrap().number, 2);
        assert_eq!(store.version("repo", 1).await?.number, 1);
        assert!(store.version("repo", 3).await.is_err());
        assert!(store.latest_version("other").await?.is_none());

        Ok(())
    }
}
