// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Verbatim publication of mirrored content.

A mirror sync retains the exact metadata files it read from the remote. Publishing
such a version verbatim serves those files unmodified, alongside every package file
at its upstream path. Upstream signatures therefore remain valid and clients see
a byte-identical copy of the remote at the time of the sync.

Every file the retained `InRelease` (or `Release`) lists must either have been
retained or have been absent from the remote at sync time. Otherwise publication
fails rather than serving a release that names files the publication lacks.
*/

use {
    super::{Publication, PublishMode, PublishedFile},
    crate::{
        content::RepositoryVersion,
        download::validate_content,
        error::{RepoSyncError, Result},
        io::validate_relative_path,
        release::parse_release,
        remote::join_path,
        storage::ArtifactStore,
    },
    std::collections::BTreeMap,
};

/// Produce a verbatim [Publication] of a mirror-mode repository version.
///
/// Retained metadata is read back from the artifact store and checked against the
/// size and digest recorded at sync time. Every file listed by the retained release
/// must be accounted for.
pub async fn publish_verbatim(
    version: &RepositoryVersion,
    store: &dyn ArtifactStore,
) -> Result<Publication> {
    let distribution_path = match (&version.origin.distribution, version.origin.mirror) {
        (Some(path), true) => path.clone(),
        _ => return Err(RepoSyncError::VerbatimRequiresMirror),
    };

    let mut files = BTreeMap::new();

    for (path, retained) in &version.origin.retained_metadata {
        validate_relative_path(path)?;

        let data = match store.get(&retained.digest).await {
            Ok(data) => data,
            Err(RepoSyncError::ArtifactNotFound(_)) => {
                return Err(RepoSyncError::MissingRetainedMetadata(path.clone()));
            }
            Err(e) => return Err(e),
        };

        validate_content(path, &data, retained.size, &retained.digest)?;

        files.insert(path.clone(), PublishedFile::Inline(data));
    }

    let release_path = ["InRelease", "Release"]
        .into_iter()
        .map(|name| join_path(&distribution_path, name))
        .find(|path| files.contains_key(path))
        .ok_or_else(|| {
            RepoSyncError::MissingRetainedMetadata(join_path(&distribution_path, "Release"))
        })?;

    let release = match files.get(&release_path) {
        Some(PublishedFile::Inline(data)) => parse_release(data)?,
        _ => return Err(RepoSyncError::MissingRetainedMetadata(release_path)),
    };

    for entry in release.entries.values() {
        let path = join_path(&distribution_path, &entry.path);

        if !files.contains_key(&path) && !version.origin.absent_metadata.contains(&path) {
            return Err(RepoSyncError::MissingRetainedMetadata(path));
        }
    }

    for unit in version.iter_units() {
        for artifact in &unit.artifacts {
            validate_relative_path(&artifact.path)?;

            files.insert(
                artifact.path.clone(),
                PublishedFile::Artifact {
                    digest: artifact.digest.clone(),
                    size: artifact.size,
                },
            );
        }
    }

    log::info!(
        "verbatim publication of {} version {} has {} files",
        version.repository,
        version.number,
        files.len()
    );

    Ok(Publication {
        repository: version.repository.clone(),
        version: version.number,
        mode: PublishMode::Verbatim,
        distribution_path,
        files,
    })
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            content::{test::unit, RetainedFile, VersionOrigin},
            error::ErrorCategory,
            io::{ChecksumType, DigestSet},
            release::{render_release, ReleaseDescriptor},
            storage::memory::MemoryArtifactStore,
        },
        chrono::Utc,
    };

    const RELEASE: &[u8] = b"Suite: stable\n";

    async fn mirror_version(store: &MemoryArtifactStore) -> Result<RepositoryVersion> {
        let digest = ChecksumType::Sha256.digest_data(RELEASE);
        store.put(&digest, RELEASE).await?;

        let a = unit("a", "1", "amd64");

        Ok(RepositoryVersion {
            repository: "mirror".into(),
            number: 1,
            created: Utc::now(),
            units: [(a.key.clone(), a)].into_iter().collect(),
            origin: VersionOrigin {
                mirror: true,
                distribution: Some("dists/stable".into()),
                retained_metadata: [(
                    "dists/stable/Release".to_string(),
                    RetainedFile {
                        size: RELEASE.len() as u64,
                        digest,
                    },
                )]
                .into_iter()
                .collect(),
                absent_metadata: Default::default(),
            },
        })
    }

    /// Retain `data` at `path` in a version.
    async fn retain(
        version: &mut RepositoryVersion,
        store: &MemoryArtifactStore,
        path: &str,
        data: &[u8],
    ) -> Result<()> {
        let digest = ChecksumType::Sha256.digest_data(data);
        store.put(&digest, data).await?;
        version.origin.retained_metadata.insert(
            path.to_string(),
            RetainedFile {
                size: data.len() as u64,
                digest,
            },
        );

        Ok(())
    }

    #[tokio::test]
    async fn upstream_paths() -> Result<()> {
        let store = MemoryArtifactStore::default();
        let version = mirror_version(&store).await?;

        let publication = publish_verbatim(&version, &store).await?;
        assert_eq!(publication.mode, PublishMode::Verbatim);
        assert_eq!(publication.distribution_path, "dists/stable");
        assert_eq!(
            publication.inline_bytes("dists/stable/Release"),
            Some(RELEASE)
        );
        assert!(publication.is_release_path("dists/stable/Release"));
        assert_eq!(
            publication
                .iter_artifacts()
                .map(|(path, _, _)| path)
                .collect::<Vec<_>>(),
            vec!["pool/main/a/a_1_amd64.deb"]
        );

        Ok(())
    }

    #[tokio::test]
    async fn missing_metadata() -> Result<()> {
        let store = MemoryArtifactStore::default();
        let version = mirror_version(&store).await?;
        store
            .remove(&ChecksumType::Sha256.digest_data(RELEASE))
            .await;

        assert!(matches!(
            publish_verbatim(&version, &store).await,
            Err(RepoSyncError::MissingRetainedMetadata(path)) if path == "dists/stable/Release"
        ));

        Ok(())
    }

    #[tokio::test]
    async fn release_entries_must_be_retained() -> Result<()> {
        let store = MemoryArtifactStore::default();
        let mut version = mirror_version(&store).await?;

        let packages = b"Package: a\n".to_vec();
        let gz = b"compressed".to_vec();
        let mut release = ReleaseDescriptor {
            suite: Some("stable".into()),
            ..Default::default()
        };
        release.add_entry(
            "main/binary-amd64/Packages",
            packages.len() as u64,
            DigestSet::digest_data(&packages),
        );
        release.add_entry(
            "main/binary-amd64/Packages.gz",
            gz.len() as u64,
            DigestSet::digest_data(&gz),
        );
        let release = render_release(&release);

        retain(&mut version, &store, "dists/stable/Release", &release).await?;
        retain(
            &mut version,
            &store,
            "dists/stable/main/binary-amd64/Packages.gz",
            &gz,
        )
        .await?;

        assert!(matches!(
            publish_verbatim(&version, &store).await,
            Err(RepoSyncError::MissingRetainedMetadata(path))
                if path == "dists/stable/main/binary-amd64/Packages"
        ));

        // Files the remote did not serve are accepted.
        version
            .origin
            .absent_metadata
            .insert("dists/stable/main/binary-amd64/Packages".into());
        let publication = publish_verbatim(&version, &store).await?;
        assert_eq!(
            publication.inline_bytes("dists/stable/main/binary-amd64/Packages.gz"),
            Some(gz.as_slice())
        );
        assert!(publication
            .inline_bytes("dists/stable/main/binary-amd64/Packages")
            .is_none());

        // Retaining the file also satisfies the check.
        version.origin.absent_metadata.clear();
        retain(
            &mut version,
            &store,
            "dists/stable/main/binary-amd64/Packages",
            &packages,
        )
        .await?;
        publish_verbatim(&version, &store).await?;

        Ok(())
    }

    #[tokio::test]
    async fn missing_release() -> Result<()> {
        let store = MemoryArtifactStore::default();
        let mut version = mirror_version(&store).await?;
        version.origin.retained_metadata.clear();

        assert!(matches!(
            publish_verbatim(&version, &store).await,
            Err(RepoSyncError::MissingRetainedMetadata(path)) if path == "dists/stable/Release"
        ));

        Ok(())
    }

    #[tokio::test]
    async fn escaping_artifact_path() -> Result<()> {
        let store = MemoryArtifactStore::default();
        let mut version = mirror_version(&store).await?;

        let mut evil = unit("evil", "1", "amd64");
        evil.artifacts[0].path = "../../etc/cron.d/evil".into();
        version.units.insert(evil.key.clone(), evil);

        assert!(matches!(
            publish_verbatim(&version, &store).await,
            Err(RepoSyncError::UnsafePath(path)) if path == "../../etc/cron.d/evil"
        ));

        Ok(())
    }

    #[tokio::test]
    async fn corrupted_metadata() -> Result<()> {
        let store = MemoryArtifactStore::default();
        let version = mirror_version(&store).await?;
        store
            .overwrite(
                &ChecksumType::Sha256.digest_data(RELEASE),
                b"Suite: unstable\n".to_vec(),
            )
            .await;

        let err = publish_verbatim(&version, &store).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);

        Ok(())
    }

    #[tokio::test]
    async fn requires_mirror() -> Result<()> {
        let store = MemoryArtifactStore::default();
        let mut version = mirror_version(&store).await?;
        version.origin.mirror = false;

        assert!(matches!(
            publish_verbatim(&version, &store).await,
            Err(RepoSyncError::VerbatimRequiresMirror)
        ));

        Ok(())
    }
}
