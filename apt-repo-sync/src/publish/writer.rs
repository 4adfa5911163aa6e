// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Writing publications to a destination.

[RepositoryWriter] is the generic interface for materializing repository files.
[FilesystemRepositoryWriter] writes into a local directory, which can then be
served by any HTTP server.

[Publication::write_to()] writes files in an order that keeps a repository
consumable while it is being updated: package files first, then indices, and the
top-level `Release` files last.
*/

use {
    super::{Publication, PublishedFile},
    crate::{
        error::{RepoSyncError, Result},
        io::{validate_relative_path, ContentDigest},
        storage::ArtifactStore,
    },
    async_trait::async_trait,
    futures::{AsyncRead, StreamExt},
    std::{
        borrow::Cow,
        path::{Path, PathBuf},
        pin::Pin,
    },
};

/// Describes a repository path verification state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RepositoryPathVerificationState {
    /// The path exists but its integrity was not verified.
    ExistsNoIntegrityCheck,
    /// The path exists and its integrity was verified.
    ExistsIntegrityVerified,
    /// The path exists and its integrity didn't match expectations.
    ExistsIntegrityMismatch,
    /// The path is missing.
    Missing,
}

/// Represents the result of a repository path verification check.
#[derive(Clone, Debug)]
pub struct RepositoryPathVerification<'a> {
    /// The path that was tested.
    pub path: &'a str,
    /// The state of the path.
    pub state: RepositoryPathVerificationState,
}

impl<'a> std::fmt::Display for RepositoryPathVerification<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state {
            RepositoryPathVerificationState::ExistsNoIntegrityCheck => {
                write!(f, "{} exists (no integrity check performed)", self.path)
            }
            RepositoryPathVerificationState::ExistsIntegrityVerified => {
                write!(f, "{} exists (integrity verified)", self.path)
            }
            RepositoryPathVerificationState::ExistsIntegrityMismatch => {
                write!(f, "{} exists (integrity mismatch!)", self.path)
            }
            RepositoryPathVerificationState::Missing => {
                write!(f, "{} missing", self.path)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct RepositoryWrite<'a> {
    /// The path that was written.
    pub path: Cow<'a, str>,
    /// The number of bytes written.
    pub bytes_written: u64,
}

/// A destination for repository files.
#[async_trait]
pub trait RepositoryWriter: Sync {
    /// Verify the existence of a path with optional content integrity checking.
    ///
    /// If the size and digest are [Some] implementations *may* perform additional
    /// content integrity verification. They should not lie about whether integrity
    /// verification was performed in the returned value, however.
    async fn verify_path<'path>(
        &self,
        path: &'path str,
        expected_content: Option<(u64, ContentDigest)>,
    ) -> Result<RepositoryPathVerification<'path>>;

    /// Write data to a given path.
    ///
    /// The data to write is provided by an [AsyncRead] reader.
    async fn write_path<'path, 'reader>(
        &self,
        path: Cow<'path, str>,
        reader: Pin<Box<dyn AsyncRead + Send + 'reader>>,
    ) -> Result<RepositoryWrite<'path>>;
}

/// A [RepositoryWriter] writing to a local directory.
#[derive(Clone, Debug)]
pub struct FilesystemRepositoryWriter {
    root_dir: PathBuf,
}

impl FilesystemRepositoryWriter {
    /// Construct a new instance bound to the root directory specified.
    ///
    /// No validation of the passed path is performed. The directory does not need to exist.
    /// Paths written through the instance must stay below this directory.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            root_dir: path.as_ref().to_path_buf(),
        }
    }

    fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RepoSyncError + '_ {
        move |e| RepoSyncError::StorageIoPath(format!("{}", path.display()), e)
    }
}

#[async_trait]
impl RepositoryWriter for FilesystemRepositoryWriter {
    async fn verify_path<'path>(
        &self,
        path: &'path str,
        expected_content: Option<(u64, ContentDigest)>,
    ) -> Result<RepositoryPathVerification<'path>> {
        let dest_path = self.root_dir.join(validate_relative_path(path)?);

        let metadata = match std::fs::metadata(&dest_path) {
            Ok(res) => res,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RepositoryPathVerification {
                    path,
                    state: RepositoryPathVerificationState::Missing,
                });
            }
            Err(e) => return Err(Self::io_error(&dest_path)(e)),
        };

        let state = if !metadata.is_file() {
            RepositoryPathVerificationState::Missing
        } else if let Some((expected_size, expected_digest)) = expected_content {
            if metadata.len() != expected_size {
                RepositoryPathVerificationState::ExistsIntegrityMismatch
            } else {
                let data = std::fs::read(&dest_path).map_err(Self::io_error(&dest_path))?;

                if expected_digest.checksum_type().digest_data(&data) == expected_digest {
                    RepositoryPathVerificationState::ExistsIntegrityVerified
                } else {
                    RepositoryPathVerificationState::ExistsIntegrityMismatch
                }
            }
        } else {
            RepositoryPathVerificationState::ExistsNoIntegrityCheck
        };

        Ok(RepositoryPathVerification { path, state })
    }

    async fn write_path<'path, 'reader>(
        &self,
        path: Cow<'path, str>,
        reader: Pin<Box<dyn AsyncRead + Send + 'reader>>,
    ) -> Result<RepositoryWrite<'path>> {
        let dest_path = self.root_dir.join(validate_relative_path(path.as_ref())?);

        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent).map_err(Self::io_error(parent))?;
        }

        let fh = std::fs::File::create(&dest_path).map_err(Self::io_error(&dest_path))?;

        let mut writer = futures::io::AllowStdIo::new(fh);

        let bytes_written = futures::io::copy(reader, &mut writer)
            .await
            .map_err(Self::io_error(&dest_path))?;

        Ok(RepositoryWrite {
            path,
            bytes_written,
        })
    }
}

/// Events emitted while writing a publication.
#[derive(Clone, Debug)]
pub enum PublishEvent {
    /// A package file already present with the expected content.
    ArtifactCurrent(String),
    /// A file was written.
    PathWritten(String, u64),
}

impl std::fmt::Display for PublishEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArtifactCurrent(path) => write!(f, "{} is up to date", path),
            Self::PathWritten(path, size) => write!(f, "wrote {} bytes to {}", size, path),
        }
    }
}

/// Summary of a [Publication::write_to()] operation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WriteSummary {
    /// Number of files written.
    pub written: usize,
    /// Number of package files skipped because they were already present.
    pub skipped: usize,
}

impl Publication {
    /// Write this publication through a [RepositoryWriter].
    ///
    /// Package file content is read from `artifacts`. Package files already present
    /// at the destination with matching content are not rewritten. Up to `threads`
    /// package files are written concurrently.
    pub async fn write_to(
        &self,
        writer: &dyn RepositoryWriter,
        artifacts: &dyn ArtifactStore,
        threads: usize,
        progress_cb: &Option<Box<dyn Fn(PublishEvent) + Sync>>,
    ) -> Result<WriteSummary> {
        let mut summary = WriteSummary::default();

        let fs = self.iter_artifacts().map(|(path, digest, size)| async move {
            let verification = writer
                .verify_path(path, Some((size, digest.clone())))
                .await?;

            if verification.state == RepositoryPathVerificationState::ExistsIntegrityVerified {
                return Ok::<_, RepoSyncError>(PublishEvent::ArtifactCurrent(path.to_string()));
            }

            let data = artifacts.get(digest).await?;
            let write = writer
                .write_path(
                    Cow::Borrowed(path),
                    Box::pin(futures::io::Cursor::new(data)),
                )
                .await?;

            Ok(PublishEvent::PathWritten(
                write.path.to_string(),
                write.bytes_written,
            ))
        });

        let mut buffered = futures::stream::iter(fs).buffer_unordered(threads.max(1));

        while let Some(res) = buffered.next().await {
            let event = res?;

            match &event {
                PublishEvent::ArtifactCurrent(_) => summary.skipped += 1,
                PublishEvent::PathWritten(_, _) => summary.written += 1,
            }

            if let Some(cb) = progress_cb {
                cb(event);
            }
        }

        // Indices before the Release files referencing them.
        let (release_files, index_files): (Vec<_>, Vec<_>) = self
            .files
            .iter()
            .filter_map(|(path, file)| match file {
                PublishedFile::Inline(data) => Some((path.as_str(), data)),
                PublishedFile::Artifact { .. } => None,
            })
            .partition(|(path, _)| self.is_release_path(path));

        for (path, data) in index_files.into_iter().chain(release_files) {
            let write = writer
                .write_path(
                    Cow::Borrowed(path),
                    Box::pin(futures::io::Cursor::new(data.as_slice())),
                )
                .await?;

            summary.written += 1;

            if let Some(cb) = progress_cb {
                cb(PublishEvent::PathWritten(
                    write.path.to_string(),
                    write.bytes_written,
                ));
            }
        }

        log::info!(
            "wrote {} files of {} version {} ({} unchanged)",
            summary.written,
            self.repository,
            self.version,
            summary.skipped
        );

        Ok(summary)
    }
}
