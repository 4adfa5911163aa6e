// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Access to remote repositories.

A remote is anything implementing [DataResolver]: given a path relative to the
repository root, it produces the content at that path. Implementations exist for
local directories ([filesystem]), HTTP servers ([http], behind the `http` feature)
and in-memory content ([memory]).
*/

use crate::{
    error::{RepoSyncError, Result},
    io::DataResolver,
};

pub mod filesystem;
#[cfg(feature = "http")]
pub mod http;
pub mod memory;

/// Join a directory path and a relative path using `/`.
pub fn join_path(a: &str, b: &str) -> String {
    let a = a.trim_matches('/');
    let b = b.trim_start_matches('/');

    if a.is_empty() {
        b.to_string()
    } else {
        format!("{}/{}", a, b)
    }
}

/// Construct a [DataResolver] for a repository URL.
///
/// `file://` URLs resolve to a [filesystem::FilesystemRepositoryReader]. `http://`
/// and `https://` URLs resolve to an [http::HttpRepositoryClient] when the `http`
/// feature is enabled.
pub fn reader_from_str(url: &str) -> Result<Box<dyn DataResolver + Send>> {
    let url = url::Url::parse(url)?;

    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| RepoSyncError::UnsupportedRemote(url.to_string()))?;

            Ok(Box::new(filesystem::FilesystemRepositoryReader::new(path)))
        }
        #[cfg(feature = "http")]
        "http" | "https" => Ok(Box::new(http::HttpRepositoryClient::new(url)?)),
        _ => Err(RepoSyncError::UnsupportedRemote(url.to_string())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn join() {
        assert_eq!(join_path("dists/stable", "InRelease"), "dists/stable/InRelease");
        assert_eq!(join_path("dists/stable/", "/main"), "dists/stable/main");
        assert_eq!(join_path("", "pool/a"), "pool/a");
    }

    #[test]
    fn unsupported_scheme() {
        assert!(matches!(
            reader_from_str("ftp://example.com/debian"),
            Err(RepoSyncError::UnsupportedRemote(_))
        ));
        assert!(reader_from_str("file:///var/empty").is_ok());
    }
}
