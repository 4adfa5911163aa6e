// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Filesystem backed storage.

[FilesystemArtifactStore] lays content out as `<root>/<checksum>/<aa>/<hex digest>`
where `aa` is the first 2 hex characters of the digest.

[FilesystemRepositoryStore] writes each version as JSON to
`<root>/<repository>/<number>.json`.
*/

use {
    crate::{
        content::RepositoryVersion,
        error::{RepoSyncError, Result},
        io::ContentDigest,
        storage::{ArtifactStore, RepositoryStore},
    },
    async_trait::async_trait,
    futures::{AsyncRead, AsyncReadExt},
    std::{
        io::Write,
        path::{Path, PathBuf},
        pin::Pin,
    },
    tempfile::NamedTempFile,
    tokio::sync::Mutex,
};

fn storage_error(path: &Path) -> impl FnOnce(std::io::Error) -> RepoSyncError + '_ {
    move |e| RepoSyncError::StorageIoPath(format!("{}", path.display()), e)
}

/// Create a uniquely named temporary file next to `path`.
///
/// Every writer gets its own file so concurrent writers of the same path never
/// share intermediate state.
fn temp_file_for(path: &Path) -> Result<NamedTempFile> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(storage_error(parent))?;

    NamedTempFile::new_in(parent).map_err(storage_error(parent))
}

/// Move a fully written temporary file into place.
fn persist(temp: NamedTempFile, path: &Path) -> Result<()> {
    temp.persist(path)
        .map_err(|e| storage_error(path)(e.error))?;

    Ok(())
}

/// Write a file such that readers never observe partial content.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut temp = temp_file_for(path)?;
    temp.write_all(data).map_err(storage_error(temp.path()))?;

    persist(temp, path)
}

/// An [ArtifactStore] backed by a directory.
#[derive(Clone, Debug)]
pub struct FilesystemArtifactStore {
    root_dir: PathBuf,
}

impl FilesystemArtifactStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            root_dir: path.as_ref().to_path_buf(),
        }
    }

    /// The filesystem path content with a given digest is stored at.
    pub fn blob_path(&self, digest: &ContentDigest) -> PathBuf {
        let hex = digest.digest_hex();
        let prefix = &hex[..2.min(hex.len())];

        self.root_dir
            .join(digest.checksum_type().to_string())
            .join(prefix)
            .join(&hex)
    }
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn exists(&self, digest: &ContentDigest) -> Result<bool> {
        Ok(self.blob_path(digest).is_file())
    }

    async fn get(&self, digest: &ContentDigest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);

        match std::fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RepoSyncError::ArtifactNotFound(digest.to_string()))
            }
            Err(e) => Err(storage_error(&path)(e)),
        }
    }

    async fn put(&self, digest: &ContentDigest, data: &[u8]) -> Result<()> {
        let path = self.blob_path(digest);

        // Content addressed files are immutable.
        if path.is_file() {
            return Ok(());
        }

        write_atomic(&path, data)
    }

    async fn put_reader(
        &self,
        digest: &ContentDigest,
        mut reader: Pin<Box<dyn AsyncRead + Send>>,
    ) -> Result<()> {
        let path = self.blob_path(digest);

        if path.is_file() {
            return Ok(());
        }

        let mut temp = temp_file_for(&path)?;
        let mut buf = vec![0u8; 65536];

        loop {
            let size = reader
                .read(&mut buf)
                .await
                .map_err(RepoSyncError::from_read_error)?;
            if size == 0 {
                break;
            }

            temp.write_all(&buf[..size])
                .map_err(storage_error(temp.path()))?;
        }

        persist(temp, &path)
    }
}

/// A [RepositoryStore] backed by a directory of JSON files.
#[derive(Debug)]
pub struct FilesystemRepositoryStore {
    root_dir: PathBuf,
    create_lock: Mutex<()>,
}

impl FilesystemRepositoryStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            root_dir: path.as_ref().to_path_buf(),
            create_lock: Mutex::new(()),
        }
    }

    fn repository_dir(&self, repository: &str) -> PathBuf {
        self.root_dir.join(repository)
    }

    fn version_path(&self, repository: &str, number: u64) -> PathBuf {
        self.repository_dir(repository)
            .join(format!("{}.json", number))
    }

    fn latest_number(&self, repository: &str) -> Result<Option<u64>> {
        let dir = self.repository_dir(repository);

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error(&dir)(e)),
        };

        let mut latest = None;
        for entry in entries {
            let entry = entry.map_err(storage_error(&dir))?;
            let name = entry.file_name();

            if let Some(number) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok())
            {
                latest = latest.max(Some(number));
            }
        }

        Ok(latest)
    }
}

#[async_trait]
impl RepositoryStore for FilesystemRepositoryStore {
    async fn latest_version(&self, repository: &str) -> Result<Option<RepositoryVersion>> {
        match self.latest_number(repository)? {
            Some(number) => Ok(Some(self.version(repository, number).await?)),
            None => Ok(None),
        }
    }

    async fn version(&self, repository: &str, number: u64) -> Result<RepositoryVersion> {
        let path = self.version_path(repository, number);

        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepoSyncError::UnknownRepositoryVersion(
                    repository.to_string(),
                    number,
                ));
            }
            Err(e) => return Err(storage_error(&path)(e)),
        };

        Ok(serde_json::from_slice(&data)?)
    }

    async fn create_version(&self, version: &RepositoryVersion) -> Result<()> {
        let _guard = self.create_lock.lock().await;

        let latest = self.latest_number(&version.repository)?;
        if version.number != latest.unwrap_or(0) + 1 {
            return Err(RepoSyncError::VersionConflict {
                repository: version.repository.clone(),
                expected: version.number.checked_sub(1).filter(|n| *n > 0),
                actual: latest,
            });
        }

        let data = serde_json::to_vec_pretty(version)?;
        write_atomic(
            &self.version_path(&version.repository, version.number),
            &data,
        )
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            content::{test::unit, VersionOrigin},
            io::{ChecksumType, ContentValidatingReader},
        },
        chrono::Utc,
    };

    #[tokio::test]
    async fn artifact_layout() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = FilesystemArtifactStore::new(td.path());

        let digest = ChecksumType::Sha256.digest_data(b"hello");
        assert_eq!(
            store.blob_path(&digest),
            td.path()
                .join("sha256")
                .join("2c")
                .join("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );

        assert!(!store.exists(&digest).await?);
        store.put(&digest, b"hello").await?;
        store.put(&digest, b"hello").await?;
        assert!(store.exists(&digest).await?);
        assert_eq!(store.get(&digest).await?, b"hello");

        let other = ChecksumType::Sha256.digest_data(b"other");
        assert!(matches!(
            store.get(&other).await,
            Err(RepoSyncError::ArtifactNotFound(_))
        ));

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_of_same_digest() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = std::sync::Arc::new(FilesystemArtifactStore::new(td.path()));

        let data = b"shared content".repeat(4096);
        let digest = ChecksumType::Sha256.digest_data(&data);

        let handles = (0..8)
            .map(|_| {
                let store = store.clone();
                let digest = digest.clone();
                let data = data.clone();

                tokio::spawn(async move { store.put(&digest, &data).await })
            })
            .collect::<Vec<_>>();

        for result in futures::future::join_all(handles).await {
            result.expect("task should not panic")?;
        }

        assert_eq!(store.get(&digest).await?, data);

        // No temporary files are left beside the blob.
        let dir = store.blob_path(&digest);
        let siblings = std::fs::read_dir(dir.parent().unwrap())?.count();
        assert_eq!(siblings, 1);

        Ok(())
    }

    #[tokio::test]
    async fn streamed_put_validates_before_storing() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = FilesystemArtifactStore::new(td.path());

        let data = b"streamed".repeat(20000);
        let digest = ChecksumType::Sha256.digest_data(&data);

        let reader = ContentValidatingReader::new(
            futures::io::Cursor::new(data.clone()),
            "pool/a.deb",
            data.len() as u64 + 1,
            digest.clone(),
        );
        let err = store.put_reader(&digest, Box::pin(reader)).await.unwrap_err();
        assert_eq!(err.as_validation().unwrap().dimension(), "size");
        assert!(!store.exists(&digest).await?);
        assert_eq!(
            std::fs::read_dir(store.blob_path(&digest).parent().unwrap())?.count(),
            0
        );

        let reader = ContentValidatingReader::new(
            futures::io::Cursor::new(data.clone()),
            "pool/a.deb",
            data.len() as u64,
            digest.clone(),
        );
        store.put_reader(&digest, Box::pin(reader)).await?;
        assert_eq!(store.get(&digest).await?, data);

        Ok(())
    }

    #[tokio::test]
    async fn version_files() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = FilesystemRepositoryStore::new(td.path());

        assert!(store.latest_version("repo").await?.is_none());

        let a = unit("a", "1", "amd64");
        let mut version = RepositoryVersion {
            repository: "repo".into(),
            number: 1,
            created: Utc::now(),
            units: [(a.key.clone(), a)].into_iter().collect(),
            origin: VersionOrigin::default(),
        };

        store.create_version(&version).await?;
        assert!(td.path().join("repo").join("1.json").is_file());
        assert_eq!(store.latest_version("repo").await?, Some(version.clone()));

        // Stale writers are rejected.
        assert!(matches!(
            store.create_version(&version).await,
            Err(RepoSyncError::VersionConflict {
                actual: Some(1),
                ..
            })
        ));

        version.number = 2;
        store.create_version(&version).await?;
        assert_eq!(store.latest_version("repo").await?.unwrap().number, 2);
        assert_eq!(store.version("repo", 1).await?.number, 1);
        assert!(matches!(
            store.version("repo", 5).await,
            Err(RepoSyncError::UnknownRepositoryVersion(_, 5))
        ));

        Ok(())
    }
}
