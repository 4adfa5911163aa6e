// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Synchronizing a local repository from a remote.

A [Syncer] runs one sync as a sequence of phases:

1. Fetch the `InRelease` file, falling back to `Release` and `Release.gpg`, then
   the `Packages` (and optionally `Sources`) indices it lists. Index content is
   verified against the size and every digest the release file declares. Mirror
   syncs also retain every other file the release lists, so the original tree can
   be republished verbatim.
2. Resolve the remote package set and plan the delta against the latest version.
3. Download every addition concurrently, validating each artifact.
4. Create the next repository version while holding the repository's finalize
   lock.

Any failure, including cancellation, leaves the previous version as the latest.
*/

use {
    crate::{
        config::RemoteConfig,
        content::{ContentUnit, RepositoryVersion, RetainedFile, VersionOrigin},
        download::{fetch_unit, validate_digests, FetchOutcome},
        error::{RepoSyncError, Result},
        io::{decompress_bytes, ChecksumType, Compression, ContentDigest, DataResolver},
        package_index::{parse_package_index, IndexFormat, PackageIndexEntry, PackageKey},
        planner::{plan, SyncDelta, SyncRun, SyncState},
        release::{parse_release, ReleaseDescriptor, ReleaseFileEntry, ReleaseSignature},
        remote::join_path,
        resolver::resolve,
        storage::{ArtifactStore, RepositoryStore},
    },
    futures::StreamExt,
    std::{
        collections::{BTreeMap, BTreeSet, HashMap},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
    tokio::sync::{Mutex, OwnedMutexGuard},
};

/// Progress of a sync.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SyncEvent {
    StateChanged(SyncState),
    MetadataFetched(String, u64),
    Planned { additions: usize, removals: usize },
    ArtifactReused(String),
    ArtifactDownloaded(String),
    VersionCreated(String, u64),
}

impl std::fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StateChanged(state) => write!(f, "sync is {}", state),
            Self::MetadataFetched(path, size) => write!(f, "fetched {} ({} bytes)", path, size),
            Self::Planned {
                additions,
                removals,
            } => write!(f, "planned {} additions and {} removals", additions, removals),
            Self::ArtifactReused(path) => write!(f, "reusing stored {}", path),
            Self::ArtifactDownloaded(path) => write!(f, "downloaded {}", path),
            Self::VersionCreated(repository, number) => {
                write!(f, "created version {} of {}", number, repository)
            }
        }
    }
}

/// A shared flag requesting that running syncs stop.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Serializes version creation per repository.
///
/// Clones share the same set of locks.
#[derive(Clone, Debug, Default)]
pub struct FinalizeLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl FinalizeLocks {
    /// Wait for exclusive access to a repository.
    pub async fn acquire(&self, repository: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .await
            .entry(repository.to_string())
            .or_default()
            .clone();

        lock.lock_owned().await
    }
}

/// Runs syncs from a remote into local storage.
pub struct Syncer<'a> {
    resolver: &'a (dyn DataResolver + Send),
    artifacts: &'a dyn ArtifactStore,
    repositories: &'a dyn RepositoryStore,
    locks: FinalizeLocks,
    cancel: CancellationFlag,
    progress_cb: Option<Box<dyn Fn(SyncEvent) + Sync + 'a>>,
}

impl<'a> Syncer<'a> {
    pub fn new(
        resolver: &'a (dyn DataResolver + Send),
        artifacts: &'a dyn ArtifactStore,
        repositories: &'a dyn RepositoryStore,
    ) -> Self {
        Self {
            resolver,
            artifacts,
            repositories,
            locks: FinalizeLocks::default(),
            cancel: CancellationFlag::default(),
            progress_cb: None,
        }
    }

    /// Share finalize locks with other syncers writing to the same stores.
    #[must_use]
    pub fn with_locks(mut self, locks: FinalizeLocks) -> Self {
        self.locks = locks;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Receive [SyncEvent]s as the sync progresses.
    #[must_use]
    pub fn with_progress_callback(mut self, cb: impl Fn(SyncEvent) + Sync + 'a) -> Self {
        self.progress_cb = Some(Box::new(cb));
        self
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(cb) = &self.progress_cb {
            cb(event);
        }
    }

    fn transition(&self, run: &mut SyncRun, to: SyncState) -> Result<()> {
        run.transition(to)?;
        log::info!("sync {}", to);
        self.emit(SyncEvent::StateChanged(to));

        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(RepoSyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sync a remote into its repository, returning the resulting latest version.
    ///
    /// When the remote announces nothing new, the existing latest version is returned
    /// and no version is created.
    pub async fn sync(&self, config: &RemoteConfig) -> Result<RepositoryVersion> {
        let mut run = SyncRun::default();
        self.emit(SyncEvent::StateChanged(run.state()));

        match self.run(config, &mut run).await {
            Ok(version) => Ok(version),
            Err(e) => {
                run.fail();
                log::warn!("sync of {} failed: {}", config.repository, e);
                self.emit(SyncEvent::StateChanged(run.state()));

                Err(e)
            }
        }
    }

    async fn run(&self, config: &RemoteConfig, run: &mut SyncRun) -> Result<RepositoryVersion> {
        let distribution_path = config.distribution_path();
        let mut retained = BTreeMap::new();

        let release = self
            .fetch_release(&distribution_path, config.mirror, &mut retained)
            .await?;

        let entries = self
            .fetch_indices(config, &distribution_path, &release, &mut retained)
            .await?;

        let absent_metadata = if config.mirror {
            self.fetch_release_files(
                &distribution_path,
                &release,
                config.max_concurrent_downloads,
                &mut retained,
            )
            .await?
        } else {
            BTreeSet::new()
        };

        self.transition(run, SyncState::Planning)?;

        let resolved = resolve(entries);
        let remote_keys = resolved.keys().cloned().collect::<BTreeSet<_>>();

        let latest = self
            .repositories
            .latest_version(&config.repository)
            .await?;
        let delta = plan(
            &latest.as_ref().map(|v| v.keys()).unwrap_or_default(),
            &remote_keys,
            config.mirror,
        );

        log::info!(
            "{}: {} additions, {} removals",
            config.repository,
            delta.additions.len(),
            delta.removals.len()
        );
        self.emit(SyncEvent::Planned {
            additions: delta.additions.len(),
            removals: delta.removals.len(),
        });

        self.transition(run, SyncState::Downloading)?;
        let mut added = self
            .download(&resolved, &delta, &BTreeMap::new(), config.max_concurrent_downloads)
            .await?;

        self.transition(run, SyncState::Finalizing)?;
        let _guard = self.locks.acquire(&config.repository).await;

        // Another sync may have finalized while this one downloaded.
        let current = self
            .repositories
            .latest_version(&config.repository)
            .await?;

        let delta = if current.as_ref().map(|v| v.number) != latest.as_ref().map(|v| v.number) {
            log::info!(
                "{} advanced to version {:?}; replanning",
                config.repository,
                current.as_ref().map(|v| v.number)
            );

            let delta = plan(
                &current.as_ref().map(|v| v.keys()).unwrap_or_default(),
                &remote_keys,
                config.mirror,
            );

            let more = self
                .download(&resolved, &delta, &added, config.max_concurrent_downloads)
                .await?;
            added.extend(more);

            delta
        } else {
            delta
        };

        let origin = VersionOrigin {
            mirror: config.mirror,
            distribution: Some(distribution_path),
            retained_metadata: retained,
            absent_metadata,
        };

        if let Some(current) = current.as_ref() {
            if delta.is_empty() && current.origin == origin {
                log::info!("{} is up to date at version {}", config.repository, current.number);
                self.transition(run, SyncState::Done)?;

                return Ok(current.clone());
            }
        }

        let version = RepositoryVersion::derive(
            &config.repository,
            current.as_ref(),
            &delta,
            added,
            origin,
            chrono::Utc::now(),
        )?;

        self.repositories.create_version(&version).await?;
        self.emit(SyncEvent::VersionCreated(
            version.repository.clone(),
            version.number,
        ));
        self.transition(run, SyncState::Done)?;

        Ok(version)
    }

    /// Record metadata content for verbatim publication.
    async fn retain(
        &self,
        retained: &mut BTreeMap<String, RetainedFile>,
        path: &str,
        data: &[u8],
        digest: Option<ContentDigest>,
    ) -> Result<()> {
        let digest = digest.unwrap_or_else(|| ChecksumType::Sha256.digest_data(data));
        self.artifacts.put(&digest, data).await?;

        retained.insert(
            path.to_string(),
            RetainedFile {
                size: data.len() as u64,
                digest,
            },
        );

        Ok(())
    }

    async fn fetch_release(
        &self,
        distribution_path: &str,
        mirror: bool,
        retained: &mut BTreeMap<String, RetainedFile>,
    ) -> Result<ReleaseDescriptor> {
        let inrelease_path = join_path(distribution_path, "InRelease");

        if let Some(data) = self.resolver.get_path_bytes_optional(&inrelease_path).await? {
            self.emit(SyncEvent::MetadataFetched(
                inrelease_path.clone(),
                data.len() as u64,
            ));
            let release = parse_release(&data)?;

            if mirror {
                self.retain(retained, &inrelease_path, &data, None).await?;
            }

            return Ok(release);
        }

        log::debug!("{} not found; falling back to Release", inrelease_path);

        let release_path = join_path(distribution_path, "Release");
        let data = self.resolver.get_path_bytes(&release_path).await?;
        self.emit(SyncEvent::MetadataFetched(
            release_path.clone(),
            data.len() as u64,
        ));
        let mut release = parse_release(&data)?;

        if mirror {
            self.retain(retained, &release_path, &data, None).await?;
        }

        let signature_path = join_path(distribution_path, "Release.gpg");
        if let Some(signature) = self.resolver.get_path_bytes_optional(&signature_path).await? {
            if mirror {
                self.retain(retained, &signature_path, &signature, None)
                    .await?;
            }

            release.signature = Some(ReleaseSignature::Detached(signature));
        }

        Ok(release)
    }

    /// Fetch the indices a sync covers, in component priority order.
    async fn fetch_indices(
        &self,
        config: &RemoteConfig,
        distribution_path: &str,
        release: &ReleaseDescriptor,
        retained: &mut BTreeMap<String, RetainedFile>,
    ) -> Result<Vec<PackageIndexEntry>> {
        let components = if config.components.is_empty() {
            &release.components
        } else {
            &config.components
        };
        let explicit_architectures = !config.architectures.is_empty();
        let architectures = if explicit_architectures {
            &config.architectures
        } else {
            &release.architectures
        };

        let mut entries = vec![];

        for component in components {
            for architecture in architectures {
                let index = match release.find_packages_index(component, architecture) {
                    Some(index) => index,
                    None if explicit_architectures => {
                        return Err(RepoSyncError::ReleaseIndexNotFound(format!(
                            "{}/binary-{}/Packages",
                            component, architecture
                        )));
                    }
                    None => {
                        log::debug!("no Packages index for {} {}", component, architecture);
                        continue;
                    }
                };

                entries.extend(
                    self.fetch_index(
                        distribution_path,
                        release,
                        index.entry,
                        index.compression,
                        IndexFormat::Packages,
                        component,
                        config.mirror,
                        retained,
                    )
                    .await?,
                );
            }

            if config.sync_sources {
                let index = release.find_sources_index(component).ok_or_else(|| {
                    RepoSyncError::ReleaseIndexNotFound(format!("{}/source/Sources", component))
                })?;

                entries.extend(
                    self.fetch_index(
                        distribution_path,
                        release,
                        index.entry,
                        index.compression,
                        IndexFormat::Sources,
                        component,
                        config.mirror,
                        retained,
                    )
                    .await?,
                );
            }
        }

        Ok(entries)
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_index(
        &self,
        distribution_path: &str,
        release: &ReleaseDescriptor,
        entry: &ReleaseFileEntry,
        compression: Compression,
        format: IndexFormat,
        component: &str,
        mirror: bool,
        retained: &mut BTreeMap<String, RetainedFile>,
    ) -> Result<Vec<PackageIndexEntry>> {
        let path = join_path(distribution_path, &entry.path);
        if entry.digests.is_empty() {
            return Err(RepoSyncError::MissingChecksums("Release", entry.path.clone()));
        }

        let data = self.resolver.get_path_bytes(&path).await?;
        validate_digests(&path, &data, entry.size, &entry.digests)?;
        self.emit(SyncEvent::MetadataFetched(path.clone(), data.len() as u64));

        if mirror {
            self.retain_entry(distribution_path, release, entry, &data, retained)
                .await?;
        }

        let decoded = decompress_bytes(&data, compression).await?;

        Ok(parse_package_index(&decoded, format)?
            .into_iter()
            .map(|e| e.with_component(component))
            .collect())
    }

    /// Retain validated content of a file the release lists.
    ///
    /// Clients of a by-hash repository fetch files by digest, so every declared digest
    /// also gets a `by-hash` path.
    async fn retain_entry(
        &self,
        distribution_path: &str,
        release: &ReleaseDescriptor,
        entry: &ReleaseFileEntry,
        data: &[u8],
        retained: &mut BTreeMap<String, RetainedFile>,
    ) -> Result<()> {
        let path = join_path(distribution_path, &entry.path);
        self.retain(retained, &path, data, entry.digests.strongest().cloned())
            .await?;

        if release.acquire_by_hash.unwrap_or_default() {
            for digest in entry.digests.iter() {
                self.artifacts.put(digest, data).await?;
                retained.insert(
                    join_path(distribution_path, &entry.by_hash_path(digest)),
                    RetainedFile {
                        size: entry.size,
                        digest: digest.clone(),
                    },
                );
            }
        }

        Ok(())
    }

    /// Retain every file the release lists that index fetching did not.
    ///
    /// Returns the paths of listed files the remote does not serve.
    async fn fetch_release_files(
        &self,
        distribution_path: &str,
        release: &ReleaseDescriptor,
        max_concurrent: usize,
        retained: &mut BTreeMap<String, RetainedFile>,
    ) -> Result<BTreeSet<String>> {
        self.check_cancelled()?;

        let pending = release
            .entries
            .values()
            .filter(|entry| !retained.contains_key(&join_path(distribution_path, &entry.path)))
            .collect::<Vec<_>>();

        let fs = pending.into_iter().map(|entry| async move {
            self.check_cancelled()?;

            let path = join_path(distribution_path, &entry.path);
            let data = self.resolver.get_path_bytes_optional(&path).await?;
            if let Some(data) = &data {
                validate_digests(&path, data, entry.size, &entry.digests)?;
                self.emit(SyncEvent::MetadataFetched(path, data.len() as u64));
            }

            Ok::<_, RepoSyncError>((entry, data))
        });

        let mut buffered = futures::stream::iter(fs).buffer_unordered(max_concurrent.max(1));

        let mut absent = BTreeSet::new();
        while let Some(res) = buffered.next().await {
            match res? {
                (entry, Some(data)) => {
                    self.retain_entry(distribution_path, release, entry, &data, retained)
                        .await?;
                }
                (entry, None) => {
                    let path = join_path(distribution_path, &entry.path);
                    log::debug!("{} is listed but not served", path);
                    absent.insert(path);
                }
            }
        }

        self.check_cancelled()?;

        Ok(absent)
    }

    /// Download the additions of a delta not already in `have`.
    async fn download(
        &self,
        resolved: &BTreeMap<PackageKey, PackageIndexEntry>,
        delta: &SyncDelta,
        have: &BTreeMap<PackageKey, ContentUnit>,
        max_concurrent: usize,
    ) -> Result<BTreeMap<PackageKey, ContentUnit>> {
        self.check_cancelled()?;

        let fs = delta
            .additions
            .iter()
            .filter(|key| !have.contains_key(key))
            .filter_map(|key| resolved.get(key))
            .map(|entry| async move {
                self.check_cancelled()?;
                fetch_unit(self.resolver, self.artifacts, entry).await
            });

        let mut buffered = futures::stream::iter(fs).buffer_unordered(max_concurrent.max(1));

        let mut units = BTreeMap::new();
        while let Some(res) = buffered.next().await {
            let (unit, outcomes) = res?;

            for (artifact, outcome) in unit.artifacts.iter().zip(outcomes) {
                self.emit(match outcome {
                    FetchOutcome::Reused => SyncEvent::ArtifactReused(artifact.path.clone()),
                    FetchOutcome::Downloaded => {
                        SyncEvent::ArtifactDownloaded(artifact.path.clone())
                    }
                });
            }

            units.insert(unit.key.clone(), unit);
        }

        self.check_cancelled()?;

        Ok(units)
    }
}
