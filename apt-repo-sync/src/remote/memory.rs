// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Repositories held in memory. */

use {
    crate::{
        error::{RepoSyncError, Result},
        io::DataResolver,
    },
    async_trait::async_trait,
    futures::AsyncRead,
    std::{
        collections::HashMap,
        pin::Pin,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    },
};

/// A [DataResolver] serving a fixed set of files.
///
/// Useful for hosts that already hold repository content and for testing.
#[derive(Clone, Debug, Default)]
pub struct MemoryRepositoryReader {
    files: HashMap<String, Vec<u8>>,
    fetches: Arc<AtomicUsize>,
}

impl MemoryRepositoryReader {
    /// Register content at a path, replacing existing content.
    pub fn insert(&mut self, path: impl ToString, data: impl Into<Vec<u8>>) {
        self.files.insert(path.to_string(), data.into());
    }

    /// Remove content at a path.
    pub fn remove(&mut self, path: &str) -> Option<Vec<u8>> {
        self.files.remove(path)
    }

    /// How many times content has been served.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataResolver for MemoryRepositoryReader {
    async fn get_path(&self, path: &str) -> Result<Pin<Box<dyn AsyncRead + Send>>> {
        let data = self
            .files
            .get(path)
            .ok_or_else(|| RepoSyncError::RemotePathNotFound(path.to_string()))?;

        self.fetches.fetch_add(1, Ordering::SeqCst);

        Ok(Box::pin(futures::io::Cursor::new(data.clone())))
    }
}
