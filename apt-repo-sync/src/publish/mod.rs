// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Publication of repository versions.

A [Publication] is the complete file tree of a Debian repository derived from one
[RepositoryVersion]. Generated metadata is held inline. Package files are held as
references into an [ArtifactStore] and are never copied into the publication.

Three [PublishMode]s exist:

* [PublishMode::Simple] puts all content in a single component.
* [PublishMode::Structured] lays content out per the declared component and
  architecture matrix.
* [PublishMode::Verbatim] reproduces the metadata of the remote a mirror sync
  fetched. See [verbatim].

Simple and structured publications are deterministic: publishing the same version
with the same options always yields the same bytes, signatures aside. The `Date`
of the `Release` file is the creation time of the version for this reason.
*/

use {
    crate::{
        content::{ContentUnit, RepositoryVersion},
        control::{ControlField, ControlParagraph},
        error::{RepoSyncError, Result},
        io::{
            compress_bytes, validate_relative_path, ChecksumType, Compression, ContentDigest,
            DigestSet,
        },
        package_index::{
            render_package_index, ContentKind, PackageIndexEntry, SOURCE_ARCHITECTURE,
        },
        release::{render_release, ReleaseDescriptor, ReleaseFileEntry},
        signing::{ReleaseSigner, SigningMode},
        storage::ArtifactStore,
    },
    serde::{Deserialize, Serialize},
    std::collections::{BTreeMap, BTreeSet},
};

pub mod verbatim;
pub mod writer;

/// Component holding all content of a simple publication.
pub const SIMPLE_COMPONENT: &str = "default";

/// Architecture of packages usable on every architecture.
const ARCHITECTURE_ALL: &str = "all";

/// How a repository version is laid out when published.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PublishMode {
    Simple,
    Structured,
    Verbatim,
}

/// Describes the layout of the `pool` part of the repository.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolLayout {
    /// File paths are `<component>/<name_prefix>/<filename>`.
    ///
    /// This is the layout as used by the Debian distribution. For packages beginning
    /// with `lib`, the prefix is `libz/<package>/`. For everything else, it is
    /// `<first character>/<package>/`.
    ComponentThenNamePrefix,
}

impl Default for PoolLayout {
    fn default() -> Self {
        Self::ComponentThenNamePrefix
    }
}

impl PoolLayout {
    /// Compute the directory holding files of a source package.
    pub fn directory(&self, component: &str, package: &str) -> String {
        match self {
            Self::ComponentThenNamePrefix => {
                let prefix = if package.starts_with("lib") {
                    package.get(0..4)
                } else {
                    package.get(0..1)
                }
                .unwrap_or(package);

                format!("pool/{}/{}/{}", component, prefix, package)
            }
        }
    }

    /// Compute the path to a file given the source package name and its filename.
    pub fn path(&self, component: &str, package: &str, filename: &str) -> String {
        format!("{}/{}", self.directory(component, package), filename)
    }
}

/// Settings of a publication.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublishOptions {
    pub mode: PublishMode,

    /// Name of the distribution. Metadata is written under `dists/<distribution>`.
    pub distribution: String,

    /// Components of a structured publication.
    pub components: Vec<String>,

    /// Architectures of a structured publication.
    ///
    /// If empty, the binary architectures present in the content are used.
    pub architectures: Vec<String>,

    pub suite: Option<String>,
    pub codename: Option<String>,
    pub origin: Option<String>,
    pub label: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,

    /// Compressions every index is written in.
    pub compressions: Vec<Compression>,

    /// Checksums listed in `Release` files.
    pub checksums: Vec<ChecksumType>,

    /// Whether indices are also made available under `by-hash` paths.
    pub acquire_by_hash: bool,

    /// Which signed `Release` variants to produce when a signer is available.
    pub signing_mode: SigningMode,

    pub pool_layout: PoolLayout,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            mode: PublishMode::Simple,
            distribution: "stable".into(),
            components: vec![],
            architectures: vec![],
            suite: None,
            codename: None,
            origin: None,
            label: None,
            version: None,
            description: None,
            compressions: vec![Compression::None, Compression::Gzip, Compression::Xz],
            checksums: vec![ChecksumType::Md5, ChecksumType::Sha256],
            acquire_by_hash: true,
            signing_mode: SigningMode::default(),
            pool_layout: PoolLayout::default(),
        }
    }
}

/// A file in a [Publication].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PublishedFile {
    /// Generated content.
    Inline(Vec<u8>),
    /// Content held by an [ArtifactStore].
    Artifact { digest: ContentDigest, size: u64 },
}

impl PublishedFile {
    pub fn size(&self) -> u64 {
        match self {
            Self::Inline(data) => data.len() as u64,
            Self::Artifact { size, .. } => *size,
        }
    }

    /// Identify the content for messages.
    fn describe(&self) -> String {
        match self {
            Self::Inline(data) => format!("{} bytes of generated content", data.len()),
            Self::Artifact { digest, .. } => digest.to_string(),
        }
    }
}

/// The file tree of a published repository version.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Publication {
    pub repository: String,
    /// Number of the repository version published.
    pub version: u64,
    pub mode: PublishMode,
    /// Path of the distribution directory, relative to the repository root.
    pub distribution_path: String,
    /// Files keyed by path relative to the repository root.
    pub files: BTreeMap<String, PublishedFile>,
}

impl Publication {
    /// Obtain the file at a path.
    pub fn get(&self, path: &str) -> Option<&PublishedFile> {
        self.files.get(path)
    }

    /// Obtain generated content at a path.
    pub fn inline_bytes(&self, path: &str) -> Option<&[u8]> {
        match self.files.get(path) {
            Some(PublishedFile::Inline(data)) => Some(data),
            _ => None,
        }
    }

    /// Iterate over files referencing stored artifacts.
    pub fn iter_artifacts(&self) -> impl Iterator<Item = (&str, &ContentDigest, u64)> {
        self.files.iter().filter_map(|(path, file)| match file {
            PublishedFile::Artifact { digest, size } => Some((path.as_str(), digest, *size)),
            PublishedFile::Inline(_) => None,
        })
    }

    /// Whether a path is one of the top-level `Release` files of the distribution.
    pub fn is_release_path(&self, path: &str) -> bool {
        path.strip_prefix(&self.distribution_path)
            .and_then(|p| p.strip_prefix('/'))
            .map(|name| matches!(name, "Release" | "Release.gpg" | "InRelease"))
            .unwrap_or(false)
    }
}

fn join(a: &str, b: &str) -> String {
    if a.is_empty() {
        b.to_string()
    } else {
        format!("{}/{}", a, b)
    }
}

/// An index file to generate, before compression.
struct IndexFile {
    /// Directory relative to the distribution directory. e.g. `main/binary-amd64`.
    directory: String,
    /// `Packages` or `Sources`.
    name: &'static str,
    component: String,
    architecture: String,
    entries: Vec<PackageIndexEntry>,
}

/// The name the pool directory of a unit is derived from.
fn source_name(unit: &ContentUnit) -> &str {
    match unit.kind {
        ContentKind::Source => &unit.key.name,
        // `Source` may carry a version: `Source: name (version)`.
        ContentKind::Binary => unit
            .paragraph
            .field_str("Source")
            .and_then(|s| s.split_whitespace().next())
            .unwrap_or(&unit.key.name),
    }
}

/// The binary architectures present in content, sorted.
///
/// Architecture `all` packages are listed in every architecture's index. Only when
/// no other architecture is present do they get a `binary-all` index of their own.
fn content_architectures<'a>(units: impl Iterator<Item = &'a ContentUnit>) -> Vec<String> {
    let mut have_all = false;
    let mut architectures = BTreeSet::new();

    for unit in units.filter(|u| u.kind == ContentKind::Binary) {
        if unit.key.architecture == ARCHITECTURE_ALL {
            have_all = true;
        } else {
            architectures.insert(unit.key.architecture.clone());
        }
    }

    if architectures.is_empty() && have_all {
        architectures.insert(ARCHITECTURE_ALL.to_string());
    }

    architectures.into_iter().collect()
}

/// Produces [Publication]s from repository versions.
pub struct Publisher<'a> {
    artifacts: &'a dyn ArtifactStore,
    signer: Option<&'a dyn ReleaseSigner>,
}

impl<'a> Publisher<'a> {
    /// Construct an instance reading stored content from an [ArtifactStore].
    pub fn new(artifacts: &'a dyn ArtifactStore) -> Self {
        Self {
            artifacts,
            signer: None,
        }
    }

    /// Sign `Release` files with the given signer.
    #[must_use]
    pub fn with_signer(mut self, signer: &'a dyn ReleaseSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Publish a repository version.
    pub async fn publish(
        &self,
        version: &RepositoryVersion,
        options: &PublishOptions,
    ) -> Result<Publication> {
        log::info!(
            "publishing version {} of {} ({})",
            version.number,
            version.repository,
            options.mode
        );

        match options.mode {
            PublishMode::Verbatim => verbatim::publish_verbatim(version, self.artifacts).await,
            PublishMode::Simple | PublishMode::Structured => {
                self.publish_generated(version, options).await
            }
        }
    }

    /// Group units into the indices of a simple publication.
    fn simple_indices(&self, version: &RepositoryVersion) -> (Vec<String>, Vec<IndexFile>) {
        let architectures = content_architectures(version.iter_units());

        let units = version
            .iter_units()
            .map(|unit| (SIMPLE_COMPONENT.to_string(), unit))
            .collect::<Vec<_>>();

        let components = vec![SIMPLE_COMPONENT.to_string()];
        let indices = self.group(&components, &architectures, &units);

        (architectures, indices)
    }

    /// Group units into the indices of a structured publication.
    fn structured_indices(
        &self,
        version: &RepositoryVersion,
        options: &PublishOptions,
    ) -> Result<(Vec<String>, Vec<IndexFile>)> {
        if options.components.is_empty() {
            return Err(RepoSyncError::PublishNoComponents("structured"));
        }

        let architectures = if options.architectures.is_empty() {
            content_architectures(
                version
                    .iter_units()
                    .filter(|u| options.components.contains(&u.component)),
            )
        } else {
            options.architectures.clone()
        };

        let mut units = vec![];
        for unit in version.iter_units() {
            if !options.components.contains(&unit.component) {
                log::warn!(
                    "excluding {}: component {} is not published",
                    unit.key,
                    unit.component
                );
                continue;
            }

            if unit.kind == ContentKind::Binary
                && unit.key.architecture != ARCHITECTURE_ALL
                && !architectures.contains(&unit.key.architecture)
            {
                log::warn!(
                    "excluding {}: architecture {} is not published",
                    unit.key,
                    unit.key.architecture
                );
                continue;
            }

            units.push((unit.component.clone(), unit));
        }

        let indices = self.group(&options.components, &architectures, &units);

        Ok((architectures, indices))
    }

    /// Build index files for the component and architecture matrix.
    ///
    /// Every cell of the matrix gets a `Packages` index, even when empty. Components
    /// with source packages also get a `Sources` index. Architecture `all` packages are
    /// listed in every architecture's index.
    fn group(
        &self,
        components: &[String],
        architectures: &[String],
        units: &[(String, &ContentUnit)],
    ) -> Vec<IndexFile> {
        let mut binary: BTreeMap<(String, String), Vec<PackageIndexEntry>> = BTreeMap::new();
        let mut sources: BTreeMap<String, Vec<PackageIndexEntry>> = BTreeMap::new();

        for component in components {
            for architecture in architectures {
                binary.insert((component.clone(), architecture.clone()), vec![]);
            }
        }

        for (component, unit) in units {
            match unit.kind {
                ContentKind::Source => {
                    sources
                        .entry(component.clone())
                        .or_default()
                        .push(unit.to_index_entry().with_component(component));
                }
                ContentKind::Binary => {
                    for architecture in architectures {
                        if &unit.key.architecture == architecture
                            || unit.key.architecture == ARCHITECTURE_ALL
                        {
                            if let Some(entries) =
                                binary.get_mut(&(component.clone(), architecture.clone()))
                            {
                                entries.push(unit.to_index_entry().with_component(component));
                            }
                        }
                    }
                }
            }
        }

        binary
            .into_iter()
            .map(|((component, architecture), entries)| IndexFile {
                directory: format!("{}/binary-{}", component, architecture),
                name: "Packages",
                component,
                architecture,
                entries,
            })
            .chain(sources.into_iter().map(|(component, entries)| IndexFile {
                directory: format!("{}/source", component),
                name: "Sources",
                component,
                architecture: SOURCE_ARCHITECTURE.to_string(),
                entries,
            }))
            .collect()
    }

    /// Point an entry at its location in the published pool.
    ///
    /// Fields describing artifacts are rewritten from the stored content so the
    /// paragraph always agrees with what is published. Returns the rewritten entry
    /// and the artifact files it references.
    fn relocate(
        &self,
        options: &PublishOptions,
        unit: &ContentUnit,
        mut entry: PackageIndexEntry,
    ) -> (PackageIndexEntry, Vec<(String, PublishedFile)>) {
        let directory = options
            .pool_layout
            .directory(&entry.component, source_name(unit));

        let mut files = vec![];
        for (reference, stored) in entry.artifacts.iter_mut().zip(unit.artifacts.iter()) {
            reference.path = format!("{}/{}", directory, stored.filename());

            files.push((
                reference.path.clone(),
                PublishedFile::Artifact {
                    digest: stored.digest.clone(),
                    size: stored.size,
                },
            ));
        }

        match entry.kind {
            ContentKind::Binary => {
                if let Some(artifact) = entry.artifacts.first() {
                    let para = &mut entry.paragraph;
                    para.set_field_from_string("Filename".into(), artifact.path.clone().into());
                    para.set_field_from_string("Size".into(), format!("{}", artifact.size).into());

                    for digest in artifact.digests.iter() {
                        para.set_field_from_string(
                            digest.checksum_type().packages_field_name().into(),
                            digest.digest_hex().into(),
                        );
                    }
                }
            }
            ContentKind::Source => {
                let para = &mut entry.paragraph;
                para.set_field_from_string("Directory".into(), directory.into());

                for checksum in ChecksumType::preferred_order() {
                    let lines = entry
                        .artifacts
                        .iter()
                        .filter_map(|a| {
                            a.digests.get(checksum).map(|d| {
                                format!("{} {} {}", d.digest_hex(), a.size, a.filename())
                            })
                        })
                        .collect::<Vec<_>>();

                    if !lines.is_empty() {
                        para.set_field(ControlField::from_lines(
                            checksum.sources_field_name().into(),
                            lines.into_iter(),
                        ));
                    }
                }
            }
        }

        (entry, files)
    }

    /// The `Release` file stored next to an index.
    fn index_release(&self, options: &PublishOptions, index: &IndexFile) -> Vec<u8> {
        let mut para = ControlParagraph::default();

        let archive = options
            .suite
            .clone()
            .unwrap_or_else(|| options.distribution.clone());
        para.set_field(ControlField::new("Archive".into(), archive.into()));

        if let Some(origin) = &options.origin {
            para.set_field(ControlField::new("Origin".into(), origin.clone().into()));
        }
        if let Some(label) = &options.label {
            para.set_field(ControlField::new("Label".into(), label.clone().into()));
        }
        para.set_field(ControlField::new(
            "Component".into(),
            index.component.clone().into(),
        ));
        para.set_field(ControlField::new(
            "Architecture".into(),
            index.architecture.clone().into(),
        ));

        let mut buffer = vec![];
        // Writing to a Vec cannot fail.
        let _ = para.write(&mut buffer);

        buffer
    }

    async fn publish_generated(
        &self,
        version: &RepositoryVersion,
        options: &PublishOptions,
    ) -> Result<Publication> {
        let (architectures, indices) = match options.mode {
            PublishMode::Structured => self.structured_indices(version, options)?,
            _ => self.simple_indices(version),
        };

        let components = match options.mode {
            PublishMode::Structured => options.components.clone(),
            _ => vec![SIMPLE_COMPONENT.to_string()],
        };

        let distribution_path = format!("dists/{}", options.distribution);
        let mut files: BTreeMap<String, PublishedFile> = BTreeMap::new();

        let mut release = ReleaseDescriptor {
            origin: options.origin.clone(),
            label: options.label.clone(),
            suite: options.suite.clone(),
            version: options.version.clone(),
            codename: options.codename.clone(),
            date: Some(version.created),
            description: options.description.clone(),
            components,
            architectures,
            acquire_by_hash: Some(options.acquire_by_hash),
            ..Default::default()
        };

        if release.suite.is_none() && release.codename.is_none() {
            release.codename = Some(options.distribution.clone());
        }

        for mut index in indices {
            let mut entries = vec![];
            for entry in std::mem::take(&mut index.entries) {
                let unit = match version.units.get(&entry.key) {
                    Some(unit) => unit,
                    None => continue,
                };

                let (entry, artifacts) = self.relocate(options, unit, entry);

                for (path, file) in artifacts {
                    validate_relative_path(&path)?;

                    if let Some(existing) = files.get(&path) {
                        if existing != &file {
                            return Err(RepoSyncError::PoolPathConflict(
                                path,
                                existing.describe(),
                                file.describe(),
                            ));
                        }
                        continue;
                    }
                    files.insert(path, file);
                }

                entries.push(entry);
            }

            let content = render_package_index(entries.iter());

            for compression in &options.compressions {
                let data = compress_bytes(&content, *compression).await?;
                let path = format!("{}/{}{}", index.directory, index.name, compression.extension());

                self.add_index(&mut release, &mut files, &distribution_path, options, path, data);
            }

            let path = format!("{}/Release", index.directory);
            let data = self.index_release(options, &index);
            self.add_index(&mut release, &mut files, &distribution_path, options, path, data);
        }

        let release_data = render_release(&release);

        if let Some(signer) = self.signer {
            if options.signing_mode.detached() {
                files.insert(
                    join(&distribution_path, "Release.gpg"),
                    PublishedFile::Inline(
                        signer
                            .sign_detached(&release_data)
                            .map_err(signing_error)?,
                    ),
                );
            }
            if options.signing_mode.inline() {
                files.insert(
                    join(&distribution_path, "InRelease"),
                    PublishedFile::Inline(
                        signer.sign_inline(&release_data).map_err(signing_error)?,
                    ),
                );
            }
        }

        files.insert(
            join(&distribution_path, "Release"),
            PublishedFile::Inline(release_data),
        );

        Ok(Publication {
            repository: version.repository.clone(),
            version: version.number,
            mode: options.mode,
            distribution_path,
            files,
        })
    }

    /// Register an index file with the `Release` file and the publication.
    fn add_index(
        &self,
        release: &mut ReleaseDescriptor,
        files: &mut BTreeMap<String, PublishedFile>,
        distribution_path: &str,
        options: &PublishOptions,
        path: String,
        data: Vec<u8>,
    ) {
        let digests = options
            .checksums
            .iter()
            .map(|checksum| checksum.digest_data(&data))
            .collect::<DigestSet>();

        let entry = ReleaseFileEntry {
            path: path.clone(),
            size: data.len() as u64,
            digests,
        };

        // Per-directory `Release` files aren't fetched by hash.
        if options.acquire_by_hash && !path.ends_with("/Release") {
            for digest in entry.digests.iter() {
                files.insert(
                    join(distribution_path, &entry.by_hash_path(digest)),
                    PublishedFile::Inline(data.clone()),
                );
            }
        }

        release.add_entry(path.clone(), entry.size, entry.digests);
        files.insert(join(distribution_path, &path), PublishedFile::Inline(data));
    }
}

fn signing_error(e: RepoSyncError) -> RepoSyncError {
    match e {
        RepoSyncError::Signing(_) => e,
        e => RepoSyncError::Signing(format!("{}", e)),
    }
}
