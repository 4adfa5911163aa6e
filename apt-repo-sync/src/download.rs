// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Fetching and validating package artifacts.

Every artifact referenced by an index entry declares a size and one or more
digests. Content is streamed from the remote into an [ArtifactStore] through a
[ContentValidatingReader] and is only admitted after its size and the strongest
declared digest have been verified. Content already present in the store under
that digest is reused without contacting the remote.
*/

use crate::{
    content::{ContentUnit, StoredArtifact},
    error::{RepoSyncError, Result, ValidationError},
    io::{ContentDigest, ContentValidatingReader, DataResolver, DigestSet},
    package_index::{ArtifactReference, PackageIndexEntry},
    storage::ArtifactStore,
};

/// How an artifact came to be in the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FetchOutcome {
    /// Content was already stored and no fetch occurred.
    Reused,
    /// Content was fetched and validated.
    Downloaded,
}

/// Verify content against a declared size and digest.
///
/// Size is compared first. When both size and digest differ only the size mismatch
/// is reported.
pub fn validate_content(
    path: &str,
    data: &[u8],
    expected_size: u64,
    expected_digest: &ContentDigest,
) -> std::result::Result<(), ValidationError> {
    let actual_size = data.len() as u64;
    if actual_size != expected_size {
        return Err(ValidationError::Size {
            path: path.to_string(),
            expected: expected_size,
            actual: actual_size,
        });
    }

    let actual = expected_digest.checksum_type().digest_data(data);
    if &actual != expected_digest {
        return Err(ValidationError::Checksum {
            path: path.to_string(),
            checksum: expected_digest.checksum_type(),
            expected: expected_digest.digest_hex(),
            actual: actual.digest_hex(),
        });
    }

    Ok(())
}

/// Verify content against a declared size and every declared digest.
///
/// Size is compared first, then digests from strongest to weakest.
pub fn validate_digests(
    path: &str,
    data: &[u8],
    expected_size: u64,
    expected_digests: &DigestSet,
) -> std::result::Result<(), ValidationError> {
    let actual = data.len() as u64;
    if actual != expected_size {
        return Err(ValidationError::Size {
            path: path.to_string(),
            expected: expected_size,
            actual,
        });
    }

    for digest in expected_digests.iter().rev() {
        validate_content(path, data, expected_size, digest)?;
    }

    Ok(())
}

/// Ensure a single artifact is present in the store, fetching it if needed.
pub async fn fetch_artifact(
    resolver: &(dyn DataResolver + Send),
    store: &dyn ArtifactStore,
    artifact: &ArtifactReference,
) -> Result<(StoredArtifact, FetchOutcome)> {
    let digest = artifact
        .strongest_digest()
        .ok_or_else(|| RepoSyncError::MissingChecksums("artifact", artifact.path.clone()))?
        .clone();

    let stored = StoredArtifact {
        path: artifact.path.clone(),
        size: artifact.size,
        digest: digest.clone(),
        digests: artifact.digests.clone(),
    };

    if store.exists(&digest).await? {
        log::debug!("{} already stored as {}", artifact.path, digest);
        return Ok((stored, FetchOutcome::Reused));
    }

    let reader = resolver.get_path(&artifact.path).await?;
    let reader = ContentValidatingReader::new(reader, &artifact.path, artifact.size, digest.clone());

    store.put_reader(&digest, Box::pin(reader)).await?;
    log::debug!(
        "stored {} ({} bytes) as {}",
        artifact.path,
        artifact.size,
        digest
    );

    Ok((stored, FetchOutcome::Downloaded))
}

/// Materialize an index entry as a [ContentUnit], also reporting how each artifact
/// was obtained.
///
/// Artifacts are processed in order. The first failure aborts.
pub async fn fetch_unit(
    resolver: &(dyn DataResolver + Send),
    store: &dyn ArtifactStore,
    entry: &PackageIndexEntry,
) -> Result<(ContentUnit, Vec<FetchOutcome>)> {
    let mut artifacts = Vec::with_capacity(entry.artifacts.len());
    let mut outcomes = Vec::with_capacity(entry.artifacts.len());

    for artifact in &entry.artifacts {
        let (stored, outcome) = fetch_artifact(resolver, store, artifact).await?;
        artifacts.push(stored);
        outcomes.push(outcome);
    }

    Ok((
        ContentUnit {
            key: entry.key.clone(),
            kind: entry.kind,
            component: entry.component.clone(),
            paragraph: entry.paragraph.clone(),
            artifacts,
        },
        outcomes,
    ))
}

/// Materialize an index entry as a [ContentUnit].
pub async fn fetch_and_validate(
    resolver: &(dyn DataResolver + Send),
    store: &dyn ArtifactStore,
    entry: &PackageIndexEntry,
) -> Result<ContentUnit> {
    Ok(fetch_unit(resolver, store, entry).await?.0)
}
