// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Locally stored content and repository versions. */

use {
    crate::{
        control::ControlParagraph,
        error::{RepoSyncError, Result},
        io::{ContentDigest, DigestSet},
        package_index::{ArtifactReference, ContentKind, PackageIndexEntry, PackageKey},
        planner::SyncDelta,
    },
    chrono::{DateTime, Utc},
    serde::{Deserialize, Deserializer, Serialize, Serializer},
    std::collections::{BTreeMap, BTreeSet},
};

/// A package file held in an artifact store.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct StoredArtifact {
    /// Path relative to the root of the repository it was fetched from.
    pub path: String,
    pub size: u64,
    /// The digest the content is stored under.
    pub digest: ContentDigest,
    /// Every digest declared for the content.
    pub digests: DigestSet,
}

impl StoredArtifact {
    /// The final path component.
    pub fn filename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Convert to the reference form used by index entries.
    pub fn to_reference(&self) -> ArtifactReference {
        ArtifactReference {
            path: self.path.clone(),
            size: self.size,
            digests: self.digests.clone(),
        }
    }
}

/// A package stored locally. Immutable once created.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ContentUnit {
    pub key: PackageKey,
    pub kind: ContentKind,
    pub component: String,
    pub paragraph: ControlParagraph<'static>,
    pub artifacts: Vec<StoredArtifact>,
}

impl ContentUnit {
    /// Obtain the index entry describing this unit.
    pub fn to_index_entry(&self) -> PackageIndexEntry {
        PackageIndexEntry {
            key: self.key.clone(),
            kind: self.kind,
            component: self.component.clone(),
            artifacts: self.artifacts.iter().map(|a| a.to_reference()).collect(),
            paragraph: self.paragraph.clone(),
        }
    }
}

/// Metadata file retained from a mirror sync.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RetainedFile {
    pub size: u64,
    pub digest: ContentDigest,
}

/// How a repository version came to be.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VersionOrigin {
    /// Whether the version was produced by a mirror-mode sync.
    pub mirror: bool,

    /// The `dists/<distribution>` path metadata was read from.
    pub distribution: Option<String>,

    /// Upstream metadata files keyed by repository relative path.
    ///
    /// Only populated for mirror syncs.
    pub retained_metadata: BTreeMap<String, RetainedFile>,

    /// Files the upstream `Release` lists but the remote did not serve.
    ///
    /// Debian archives commonly list uncompressed indices they only serve
    /// compressed. Only populated for mirror syncs.
    #[serde(default)]
    pub absent_metadata: BTreeSet<String>,
}

/// An immutable snapshot of a repository's content.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RepositoryVersion {
    pub repository: String,
    /// Starts at 1 and increases by 1 for every version of a repository.
    pub number: u64,
    pub created: DateTime<Utc>,
    #[serde(
        serialize_with = "serialize_units",
        deserialize_with = "deserialize_units"
    )]
    pub units: BTreeMap<PackageKey, ContentUnit>,
    pub origin: VersionOrigin,
}

fn serialize_units<S: Serializer>(
    units: &BTreeMap<PackageKey, ContentUnit>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(units.values())
}

fn deserialize_units<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<BTreeMap<PackageKey, ContentUnit>, D::Error> {
    Ok(Vec::<ContentUnit>::deserialize(deserializer)?
        .into_iter()
        .map(|unit| (unit.key.clone(), unit))
        .collect())
}

impl RepositoryVersion {
    /// Natural keys of all content in this version.
    pub fn keys(&self) -> BTreeSet<PackageKey> {
        self.units.keys().cloned().collect()
    }

    /// Iterate over content units, ordered by natural key.
    pub fn iter_units(&self) -> impl Iterator<Item = &ContentUnit> {
        self.units.values()
    }

    /// Create the version that follows `previous` by applying a delta.
    ///
    /// `added` must hold a unit for every key in `delta.additions`. Units in `added`
    /// that the delta doesn't call for are ignored.
    pub fn derive(
        repository: &str,
        previous: Option<&RepositoryVersion>,
        delta: &SyncDelta,
        mut added: BTreeMap<PackageKey, ContentUnit>,
        origin: VersionOrigin,
        created: DateTime<Utc>,
    ) -> Result<Self> {
        let mut units = previous.map(|v| v.units.clone()).unwrap_or_default();

        for key in &delta.removals {
            units.remove(key);
        }

        for key in &delta.additions {
            let unit = added
                .remove(key)
                .ok_or_else(|| RepoSyncError::MissingContentUnit(key.to_string()))?;
            units.insert(key.clone(), unit);
        }

        Ok(Self {
            repository: repository.to_string(),
            number: previous.map(|v| v.number + 1).unwrap_or(1),
            created,
            units,
            origin,
        })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use {
        super::*,
        crate::{control::ControlField, io::ChecksumType},
        chrono::TimeZone,
    };

    pub fn unit(name: &str, version: &str, architecture: &str) -> ContentUnit {
        let key = PackageKey::new(name, version, architecture);
        let filename = format!("{}_{}_{}.deb", name, version, architecture);
        let data = key.to_string();
        let digests = DigestSet::digest_data(data.as_bytes());

        let mut paragraph = ControlParagraph::default();
        for (k, v) in [
            ("Package", name),
            ("Version", version),
            ("Architecture", architecture),
        ] {
            paragraph.set_field(ControlField::new(k.into(), v.to_string().into()));
        }

        ContentUnit {
            key,
            kind: ContentKind::Binary,
            component: "main".into(),
            paragraph,
            artifacts: vec![StoredArtifact {
                path: format!("pool/main/{}/{}", name, filename),
                size: data.len() as u64,
                digest: ChecksumType::Sha256.digest_data(data.as_bytes()),
                digests,
            }],
        }
    }

    #[test]
    fn derive_applies_delta() -> Result<()> {
        let created = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        let a = unit("a", "1", "amd64");
        let b = unit("b", "1", "amd64");

        let delta = SyncDelta {
            additions: [a.key.clone()].into_iter().collect(),
            removals: BTreeSet::new(),
        };
        let v1 = RepositoryVersion::derive(
            "repo",
            None,
            &delta,
            [(a.key.clone(), a.clone())].into_iter().collect(),
            VersionOrigin::default(),
            created,
        )?;
        assert_eq!(v1.number, 1);
        assert_eq!(v1.keys(), [a.key.clone()].into_iter().collect());

        let delta = SyncDelta {
            additions: [b.key.clone()].into_iter().collect(),
            removals: [a.key.clone()].into_iter().collect(),
        };
        let v2 = RepositoryVersion::derive(
            "repo",
            Some(&v1),
            &delta,
            [(b.key.clone(), b.clone())].into_iter().collect(),
            VersionOrigin::default(),
            created,
        )?;
        assert_eq!(v2.number, 2);
        assert_eq!(v2.keys(), [b.key.clone()].into_iter().collect());

        // The previous version is untouched.
        assert_eq!(v1.keys(), [a.key.clone()].into_iter().collect());

        let missing = RepositoryVersion::derive(
            "repo",
            Some(&v2),
            &SyncDelta {
                additions: [a.key.clone()].into_iter().collect(),
                removals: BTreeSet::new(),
            },
            BTreeMap::new(),
            VersionOrigin::default(),
            created,
        );
        assert!(matches!(missing, Err(RepoSyncError::MissingContentUnit(_))));

        Ok(())
    }

    #[test]
    fn json_round_trip() -> Result<()> {
        let a = unit("a", "1", "amd64");
        let version = RepositoryVersion {
            repository: "repo".into(),
            number: 3,
            created: Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
            units: [(a.key.clone(), a)].into_iter().collect(),
            origin: VersionOrigin {
                mirror: true,
                distribution: Some("dists/stable".into()),
                retained_metadata: [(
                    "dists/stable/Release".to_string(),
                    RetainedFile {
                        size: 4,
                        digest: ChecksumType::Sha256.digest_data(b"test"),
                    },
                )]
                .into_iter()
                .collect(),
                absent_metadata: ["dists/stable/main/binary-amd64/Packages".to_string()]
                    .into_iter()
                    .collect(),
            },
        };

        let json = serde_json::to_string(&version)?;
        let restored: RepositoryVersion = serde_json::from_str(&json)?;
        assert_eq!(restored, version);

        Ok(())
    }
}
