// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Configuration of syncs and publications.

These types are deserializable so hosts can load them from whatever format they
store settings in. Every setting is passed explicitly to the operation using it.
*/

use {
    crate::{
        io::{ChecksumType, Compression},
        publish::{PublishMode, PublishOptions},
        signing::SigningMode,
    },
    serde::{Deserialize, Serialize},
};

fn default_max_concurrent_downloads() -> usize {
    8
}

fn default_compressions() -> Vec<Compression> {
    vec![Compression::None, Compression::Gzip, Compression::Xz]
}

fn default_checksums() -> Vec<ChecksumType> {
    vec![ChecksumType::Md5, ChecksumType::Sha256]
}

fn default_true() -> bool {
    true
}

/// Describes a remote repository and how to sync from it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Name of the local repository receiving content.
    pub repository: String,

    /// Base URL of the remote. e.g. `https://deb.debian.org/debian`.
    pub url: String,

    /// Distribution to sync. e.g. `bookworm`.
    ///
    /// Values containing a `/` are treated as a path relative to the repository root.
    /// Otherwise the distribution lives under `dists/`.
    pub distribution: String,

    /// Components to sync, in priority order.
    ///
    /// When a package is announced by several components, the last one wins. If
    /// empty, every component the `Release` file declares is synced.
    #[serde(default)]
    pub components: Vec<String>,

    /// Architectures to sync.
    ///
    /// If empty, every architecture the `Release` file declares is synced.
    #[serde(default)]
    pub architectures: Vec<String>,

    /// Whether the local repository should become an exact copy of the remote.
    ///
    /// Mirror syncs remove content the remote no longer announces and retain the
    /// remote's metadata files for verbatim publication.
    #[serde(default)]
    pub mirror: bool,

    /// Whether to sync source packages.
    #[serde(default)]
    pub sync_sources: bool,

    /// Maximum number of artifact downloads in flight.
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
}

impl RemoteConfig {
    /// Construct an instance with default settings.
    pub fn new(repository: impl ToString, url: impl ToString, distribution: impl ToString) -> Self {
        Self {
            repository: repository.to_string(),
            url: url.to_string(),
            distribution: distribution.to_string(),
            components: vec![],
            architectures: vec![],
            mirror: false,
            sync_sources: false,
            max_concurrent_downloads: default_max_concurrent_downloads(),
        }
    }

    /// The path of the distribution directory relative to the repository root.
    pub fn distribution_path(&self) -> String {
        if self.distribution.contains('/') {
            self.distribution.trim_matches('/').to_string()
        } else {
            format!("dists/{}", self.distribution)
        }
    }
}

/// Describes the signing key used by a publication.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SigningConfig {
    /// Path to an ASCII armored PGP secret key.
    pub key_path: String,

    /// Name of an environment variable holding the key's passphrase.
    pub passphrase_env: Option<String>,

    #[serde(default)]
    pub mode: SigningMode,
}

/// Describes how to publish a repository version.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PublishConfig {
    pub mode: PublishMode,

    /// Distribution to publish as. e.g. `stable`.
    ///
    /// Ignored by verbatim publications, which reuse the synced distribution path.
    pub distribution: String,

    /// Components of a structured publication. Ignored by other modes.
    #[serde(default)]
    pub components: Vec<String>,

    /// Architectures of a structured publication. Ignored by other modes.
    #[serde(default)]
    pub architectures: Vec<String>,

    pub suite: Option<String>,
    pub codename: Option<String>,
    pub origin: Option<String>,
    pub label: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,

    /// Compressions each index is written in.
    #[serde(default = "default_compressions")]
    pub compressions: Vec<Compression>,

    /// Checksums listed in generated `Release` files.
    #[serde(default = "default_checksums")]
    pub checksums: Vec<ChecksumType>,

    /// Whether to also expose indices under `by-hash` paths.
    #[serde(default = "default_true")]
    pub acquire_by_hash: bool,

    pub signing: Option<SigningConfig>,
}

impl PublishConfig {
    /// Resolve the [PublishOptions] this configuration describes.
    pub fn to_options(&self) -> PublishOptions {
        PublishOptions {
            mode: self.mode,
            distribution: self.distribution.clone(),
            components: self.components.clone(),
            architectures: self.architectures.clone(),
            suite: self.suite.clone(),
            codename: self.codename.clone(),
            origin: self.origin.clone(),
            label: self.label.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            compressions: self.compressions.clone(),
            checksums: self.checksums.clone(),
            acquire_by_hash: self.acquire_by_hash,
            signing_mode: self
                .signing
                .as_ref()
                .map(|s| s.mode)
                .unwrap_or_default(),
            ..PublishOptions::default()
        }
    }
}
