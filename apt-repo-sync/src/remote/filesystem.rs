// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Repositories on the local filesystem. */

use {
    crate::{
        error::{RepoSyncError, Result},
        io::DataResolver,
    },
    async_trait::async_trait,
    futures::{io::BufReader, AsyncRead},
    std::{
        path::{Path, PathBuf},
        pin::Pin,
    },
};

/// Reads a repository laid out in a local directory.
#[derive(Clone, Debug)]
pub struct FilesystemRepositoryReader {
    root_dir: PathBuf,
}

impl FilesystemRepositoryReader {
    /// Construct a new instance, bound to the root directory specified.
    ///
    /// No validation of the passed path is performed.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            root_dir: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl DataResolver for FilesystemRepositoryReader {
    async fn get_path(&self, path: &str) -> Result<Pin<Box<dyn AsyncRead + Send>>> {
        let path = self.root_dir.join(path);

        let f = std::fs::File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RepoSyncError::RemotePathNotFound(format!("{}", path.display()))
            } else {
                RepoSyncError::RemoteIoPath(format!("{}", path.display()), e)
            }
        })?;

        Ok(Box::pin(BufReader::new(futures::io::AllowStdIo::new(f))))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn read_and_missing() -> Result<()> {
        let td = tempfile::tempdir()?;
        std::fs::create_dir_all(td.path().join("dists/stable"))?;
        std::fs::write(td.path().join("dists/stable/Release"), b"Suite: stable\n")?;

        let reader = FilesystemRepositoryReader::new(td.path());
        assert_eq!(
            reader.get_path_bytes("dists/stable/Release").await?,
            b"Suite: stable\n"
        );
        assert!(matches!(
            reader.get_path_bytes("dists/stable/InRelease").await,
            Err(RepoSyncError::RemotePathNotFound(_))
        ));
        assert!(reader
            .get_path_bytes_optional("dists/stable/InRelease")
            .await?
            .is_none());

        Ok(())
    }
}
