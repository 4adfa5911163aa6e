// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Storage of artifacts and repository versions.

The host owns persistence. This crate consumes it through two traits:

* [ArtifactStore] holds immutable blobs keyed by content digest.
* [RepositoryStore] holds the ordered [RepositoryVersion] history of repositories.

In-memory ([memory]) and filesystem ([filesystem]) implementations are provided.
*/

use {
    crate::{
        content::RepositoryVersion,
        error::{RepoSyncError, Result},
        io::ContentDigest,
    },
    async_trait::async_trait,
    futures::{AsyncRead, AsyncReadExt},
    std::pin::Pin,
};

pub mod filesystem;
pub mod memory;

/// A content addressed blob store.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Whether content with the given digest is held.
    async fn exists(&self, digest: &ContentDigest) -> Result<bool>;

    /// Obtain the content stored under a digest.
    ///
    /// Missing content yields [crate::error::RepoSyncError::ArtifactNotFound].
    async fn get(&self, digest: &ContentDigest) -> Result<Vec<u8>>;

    /// Store content under its digest.
    ///
    /// Storing content that is already present is a no-op. The caller is responsible
    /// for `digest` actually describing `data`.
    async fn put(&self, digest: &ContentDigest, data: &[u8]) -> Result<()>;

    /// Store content read from a stream under its digest.
    ///
    /// Nothing is stored if reading fails. Errors from the reader are mapped through
    /// [RepoSyncError::from_read_error], so validating readers surface their
    /// validation failures. The default implementation buffers the stream and calls
    /// [Self::put].
    async fn put_reader(
        &self,
        digest: &ContentDigest,
        mut reader: Pin<Box<dyn AsyncRead + Send>>,
    ) -> Result<()> {
        let mut data = vec![];
        reader
            .read_to_end(&mut data)
            .await
            .map_err(RepoSyncError::from_read_error)?;

        self.put(digest, &data).await
    }
}

/// Versioned repository content.
#[async_trait]
pub trait RepositoryStore: Send + Sync {
    /// Obtain the most recent version of a repository, if it has any.
    async fn latest_version(&self, repository: &str) -> Result<Option<RepositoryVersion>>;

    /// Obtain a specific version of a repository.
    async fn version(&self, repository: &str, number: u64) -> Result<RepositoryVersion>;

    /// Record a new version.
    ///
    /// The version's number must immediately follow the current latest version.
    /// Otherwise [crate::error::RepoSyncError::VersionConflict] is returned and
    /// nothing is recorded.
    async fn create_version(&self, version: &RepositoryVersion) -> Result<()>;
}
