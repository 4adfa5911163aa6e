// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Repositories served via HTTP. */

use {
    crate::{
        error::{RepoSyncError, Result},
        io::DataResolver,
    },
    async_trait::async_trait,
    futures::{stream::TryStreamExt, AsyncRead},
    reqwest::{Client, IntoUrl, StatusCode, Url},
    std::pin::Pin,
};

fn io_error(path: &str, message: String) -> RepoSyncError {
    RepoSyncError::RemoteIoPath(
        path.to_string(),
        std::io::Error::new(std::io::ErrorKind::Other, message),
    )
}

async fn fetch_url(
    client: &Client,
    root_url: &Url,
    path: &str,
) -> Result<Pin<Box<dyn AsyncRead + Send>>> {
    let url = root_url.join(path)?;
    log::debug!("fetching {}", url);

    let res = client
        .get(url)
        .send()
        .await
        .map_err(|e| io_error(path, format!("error sending HTTP request: {:?}", e)))?;

    if res.status() == StatusCode::NOT_FOUND {
        return Err(RepoSyncError::RemotePathNotFound(path.to_string()));
    }

    let res = res
        .error_for_status()
        .map_err(|e| io_error(path, format!("bad HTTP status code: {:?}", e)))?;

    Ok(Box::pin(
        res.bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("{:?}", e)))
            .into_async_read(),
    ))
}

/// Client for a Debian repository served via HTTP.
///
/// Instances are bound to a base URL, which represents the base directory. e.g. for
/// `deb https://deb.debian.org/debian stable main`, the URL would be
/// `https://deb.debian.org/debian`.
#[derive(Debug)]
pub struct HttpRepositoryClient {
    client: Client,
    root_url: Url,
}

impl HttpRepositoryClient {
    /// Construct an instance bound to the specified URL.
    pub fn new(url: impl IntoUrl) -> Result<Self> {
        Self::new_client(Client::default(), url)
    }

    /// Construct an instance using the given [Client] and URL.
    pub fn new_client(client: Client, url: impl IntoUrl) -> Result<Self> {
        let mut root_url = url.into_url()?;

        // Url.join() drops the final path segment unless it ends with a slash.
        if !root_url.path().ends_with('/') {
            root_url.set_path(&format!("{}/", root_url.path()));
        }

        Ok(Self { client, root_url })
    }

    /// The base URL of the repository.
    pub fn url(&self) -> &Url {
        &self.root_url
    }
}

#[async_trait]
impl DataResolver for HttpRepositoryClient {
    async fn get_path(&self, path: &str) -> Result<Pin<Box<dyn AsyncRead + Send>>> {
        fetch_url(&self.client, &self.root_url, path).await
    }
}
