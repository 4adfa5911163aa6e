// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `Packages` and `Sources` index primitives.

A `Packages` file is a control file with one paragraph per binary package. A
`Sources` file is a control file with one paragraph per source package. Both
reference files (the artifacts) by a repository relative path, a size, and one
or more content digests.

[parse_package_index()] turns an index into [PackageIndexEntry] instances, each
keeping its complete [ControlParagraph] so that fields this crate doesn't
interpret survive a round trip through [render_package_index()].
*/

use {
    crate::{
        control::{ControlFile, ControlParagraph},
        error::{RepoSyncError, Result},
        io::{validate_relative_path, ChecksumType, ContentDigest, DigestSet},
    },
    serde::{Deserialize, Serialize},
    std::collections::BTreeMap,
};

/// Architecture value used in the natural key of source packages.
pub const SOURCE_ARCHITECTURE: &str = "source";

/// The natural key of a package.
///
/// No two packages in a repository version share a key.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct PackageKey {
    pub name: String,
    pub version: String,
    pub architecture: String,
}

impl PackageKey {
    pub fn new(
        name: impl ToString,
        version: impl ToString,
        architecture: impl ToString,
    ) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            architecture: architecture.to_string(),
        }
    }

    /// Whether this key identifies a source package.
    pub fn is_source(&self) -> bool {
        self.architecture == SOURCE_ARCHITECTURE
    }
}

impl std::fmt::Display for PackageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}_{}", self.name, self.version, self.architecture)
    }
}

/// The flavor of index being read.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum IndexFormat {
    /// A `Packages` file describing binary packages.
    Packages,
    /// A `Sources` file describing source packages.
    Sources,
}

impl IndexFormat {
    fn paragraph_kind(&self) -> &'static str {
        match self {
            Self::Packages => "Packages",
            Self::Sources => "Sources",
        }
    }
}

/// The kind of content a package represents.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Binary,
    Source,
}

/// A file referenced by an index entry.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct ArtifactReference {
    /// Path relative to the repository root.
    pub path: String,
    /// Declared size in bytes.
    pub size: u64,
    /// Declared digests. Never empty.
    pub digests: DigestSet,
}

impl ArtifactReference {
    /// The final path component.
    pub fn filename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// The strongest declared digest.
    pub fn strongest_digest(&self) -> Option<&ContentDigest> {
        self.digests.strongest()
    }
}

/// A package described by a `Packages` or `Sources` paragraph.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PackageIndexEntry {
    pub key: PackageKey,
    pub kind: ContentKind,
    /// Repository component the entry was announced in.
    ///
    /// Parsing leaves this empty; readers that know where an index came from fill it in.
    pub component: String,
    pub artifacts: Vec<ArtifactReference>,
    pub paragraph: ControlParagraph<'static>,
}

impl PackageIndexEntry {
    /// Construct an instance from a parsed control paragraph.
    pub fn from_paragraph(paragraph: ControlParagraph<'static>, format: IndexFormat) -> Result<Self> {
        let kind = format.paragraph_kind();

        let name = paragraph.required_field_str(kind, "Package")?;
        let version = paragraph.required_field_str(kind, "Version")?;

        let (key, content_kind, artifacts) = match format {
            IndexFormat::Packages => {
                let architecture = paragraph.required_field_str(kind, "Architecture")?;
                let key = PackageKey::new(name, version, architecture);
                let artifact = binary_artifact(&paragraph, &key)?;

                (key, ContentKind::Binary, vec![artifact])
            }
            IndexFormat::Sources => {
                let key = PackageKey::new(name, version, SOURCE_ARCHITECTURE);
                let artifacts = source_artifacts(&paragraph, &key)?;

                (key, ContentKind::Source, artifacts)
            }
        };

        Ok(Self {
            key,
            kind: content_kind,
            component: String::new(),
            artifacts,
            paragraph,
        })
    }

    /// Set the component this entry belongs to.
    #[must_use]
    pub fn with_component(mut self, component: impl ToString) -> Self {
        self.component = component.to_string();
        self
    }

    /// Path of the first artifact, used as a secondary sort key.
    fn primary_path(&self) -> &str {
        self.artifacts
            .first()
            .map(|a| a.path.as_str())
            .unwrap_or_default()
    }
}

fn binary_artifact(paragraph: &ControlParagraph, key: &PackageKey) -> Result<ArtifactReference> {
    let path = paragraph.required_field_str("Packages", "Filename")?;
    let size = paragraph
        .field_u64("Size")
        .ok_or(RepoSyncError::MissingField("Packages", "Size"))??;

    let digests = ChecksumType::preferred_order()
        .filter_map(|checksum| {
            paragraph
                .field_str(checksum.packages_field_name())
                .map(|v| ContentDigest::from_hex_digest(checksum, v.trim()))
        })
        .collect::<Result<DigestSet>>()?;

    if digests.is_empty() {
        return Err(RepoSyncError::MissingChecksums("Packages", key.to_string()));
    }

    Ok(ArtifactReference {
        path: validate_relative_path(path)?.to_string(),
        size,
        digests,
    })
}

fn source_artifacts(
    paragraph: &ControlParagraph,
    key: &PackageKey,
) -> Result<Vec<ArtifactReference>> {
    let directory = paragraph
        .field_str("Directory")
        .map(|d| d.trim().trim_end_matches('/'))
        .unwrap_or_default();

    // Filename -> (size, digests), in order of first appearance.
    let mut files: BTreeMap<&str, (u64, DigestSet)> = BTreeMap::new();
    let mut order = vec![];

    for checksum in ChecksumType::preferred_order() {
        let lines = match paragraph.iter_field_lines(checksum.sources_field_name()) {
            Some(lines) => lines,
            None => continue,
        };

        for line in lines {
            // Lines are of form: <digest> <size> <filename>
            let mut parts = line.split_ascii_whitespace();

            let digest = parts.next().ok_or(RepoSyncError::ReleaseMissingDigest)?;
            let size = parts.next().ok_or(RepoSyncError::ReleaseMissingSize)?;
            let filename = parts.next().ok_or(RepoSyncError::ReleaseMissingPath)?;

            if parts.next().is_some() {
                return Err(RepoSyncError::ReleasePathWithSpaces(line.to_string()));
            }

            let digest = ContentDigest::from_hex_digest(checksum, digest)?;
            let size = size.parse::<u64>()?;

            let entry = files.entry(filename).or_insert_with(|| {
                order.push(filename);
                (size, DigestSet::default())
            });

            if entry.0 != size {
                return Err(RepoSyncError::ReleaseConflictingSizes(
                    filename.to_string(),
                    entry.0,
                    size,
                ));
            }

            entry.1.insert(digest);
        }
    }

    if files.is_empty() {
        return Err(RepoSyncError::MissingChecksums("Sources", key.to_string()));
    }

    order
        .into_iter()
        .filter_map(|filename| {
            files.remove(filename).map(|(size, digests)| {
                let path = if directory.is_empty() {
                    filename.to_string()
                } else {
                    format!("{}/{}", directory, filename)
                };
                validate_relative_path(&path)?;

                Ok(ArtifactReference {
                    path,
                    size,
                    digests,
                })
            })
        })
        .collect()
}

/// Parse the content of a `Packages` or `Sources` file.
///
/// Entries are emitted in file order. Any paragraph lacking a natural key field
/// or declaring no checksums fails the whole parse.
pub fn parse_package_index(data: &[u8], format: IndexFormat) -> Result<Vec<PackageIndexEntry>> {
    ControlFile::parse_bytes(data)?
        .into_paragraphs()
        .map(|p| PackageIndexEntry::from_paragraph(p, format))
        .collect()
}

/// Serialize index entries into a `Packages` or `Sources` file.
///
/// Output is deterministic: entries are sorted by natural key then artifact path,
/// and each paragraph is written with its fields in their recorded order.
pub fn render_package_index<'a>(entries: impl IntoIterator<Item = &'a PackageIndexEntry>) -> Vec<u8> {
    let mut entries = entries.into_iter().collect::<Vec<_>>();
    entries.sort_by(|a, b| {
        a.key
            .cmp(&b.key)
            .then_with(|| a.primary_path().cmp(b.primary_path()))
    });

    let mut control = ControlFile::default();
    for entry in entries {
        control.add_paragraph(entry.paragraph.clone());
    }

    let mut buffer = vec![];
    // Writing to a Vec cannot fail.
    let _ = control.write(&mut buffer);

    buffer
}

#[cfg(test)]
mod test {
    use {super::*, indoc::indoc};

    const PACKAGES: &str = indoc! {"
        Package: zsh
        Version: 5.8-6
        Architecture: amd64
        Maintainer: Debian Zsh Maintainers <pkg-zsh-devel@lists.alioth.debian.org>
        Filename: pool/main/z/zsh/zsh_5.8-6_amd64.deb
        Size: 100
        MD5sum: 0123456789abcdef0123456789abcdef
        SHA256: 2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824
        X-Unknown: kept
        Description: shell with lots of features
         Zsh is a UNIX command interpreter.

        Package: bash
        Version: 5.1-2
        Architecture: amd64
        Filename: pool/main/b/bash/bash_5.1-2_amd64.deb
        Size: 42
        SHA256: 486ea46224d1bb4fb680f34f7c9ad96a8f24ec88be73ea8e5a6c65260e9cb8a7
    "};

    const SOURCES: &str = indoc! {"
        Package: hello
        Binary: hello
        Version: 2.10-2
        Directory: pool/main/h/hello
        Files:
         6af2a7cfa3ad5bb8f2e8e0a7c4a8e1b2 1183 hello_2.10-2.dsc
         b2c4a5d7a1c3e5f7b9d1a3c5e7f9b1d3 725946 hello_2.10.orig.tar.gz
        Checksums-Sha256:
         2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824 1183 hello_2.10-2.dsc
         486ea46224d1bb4fb680f34f7c9ad96a8f24ec88be73ea8e5a6c65260e9cb8a7 725946 hello_2.10.orig.tar.gz
    "};

    #[test]
    fn parse_packages() -> Result<()> {
        let entries = parse_package_index(PACKAGES.as_bytes(), IndexFormat::Packages)?;
        assert_eq!(entries.len(), 2);

        let zsh = &entries[0];
        assert_eq!(zsh.key, PackageKey::new("zsh", "5.8-6", "amd64"));
        assert_eq!(zsh.kind, ContentKind::Binary);
        assert_eq!(zsh.artifacts.len(), 1);
        assert_eq!(zsh.artifacts[0].path, "pool/main/z/zsh/zsh_5.8-6_amd64.deb");
        assert_eq!(zsh.artifacts[0].filename(), "zsh_5.8-6_amd64.deb");
        assert_eq!(zsh.artifacts[0].size, 100);
        assert_eq!(zsh.artifacts[0].digests.iter().count(), 2);
        assert_eq!(
            zsh.artifacts[0].strongest_digest().unwrap().checksum_type(),
            ChecksumType::Sha256
        );
        assert_eq!(zsh.paragraph.field_str("X-Unknown"), Some("kept"));

        Ok(())
    }

    #[test]
    fn parse_sources() -> Result<()> {
        let entries = parse_package_index(SOURCES.as_bytes(), IndexFormat::Sources)?;
        assert_eq!(entries.len(), 1);

        let hello = &entries[0];
        assert_eq!(hello.key, PackageKey::new("hello", "2.10-2", "source"));
        assert!(hello.key.is_source());
        assert_eq!(hello.kind, ContentKind::Source);
        assert_eq!(
            hello
                .artifacts
                .iter()
                .map(|a| a.path.as_str())
                .collect::<Vec<_>>(),
            vec![
                "pool/main/h/hello/hello_2.10-2.dsc",
                "pool/main/h/hello/hello_2.10.orig.tar.gz"
            ]
        );
        assert!(hello.artifacts.iter().all(|a| a.digests.iter().count() == 2));
        assert_eq!(hello.artifacts[1].size, 725946);

        Ok(())
    }

    #[test]
    fn missing_key_field_names_field() {
        let data = indoc! {"
            Package: foo
            Architecture: amd64
            Filename: pool/main/f/foo/foo.deb
            Size: 1
            SHA256: 00
        "};

        let err = parse_package_index(data.as_bytes(), IndexFormat::Packages).unwrap_err();
        assert!(matches!(err, RepoSyncError::MissingField("Packages", "Version")));
        assert!(err.to_string().contains("Version"));

        let data = indoc! {"
            Package: foo
            Version: 1
            Filename: pool/main/f/foo/foo.deb
            Size: 1
            SHA256: 00
        "};
        assert!(matches!(
            parse_package_index(data.as_bytes(), IndexFormat::Packages),
            Err(RepoSyncError::MissingField("Packages", "Architecture"))
        ));
    }

    #[test]
    fn missing_checksums_rejected() {
        let data = indoc! {"
            Package: foo
            Version: 1
            Architecture: all
            Filename: pool/main/f/foo/foo.deb
            Size: 1
        "};

        assert!(matches!(
            parse_package_index(data.as_bytes(), IndexFormat::Packages),
            Err(RepoSyncError::MissingChecksums("Packages", _))
        ));
    }

    #[test]
    fn escaping_paths_rejected() {
        let data = indoc! {"
            Package: foo
            Version: 1
            Architecture: all
            Filename: ../../etc/passwd
            Size: 1
            SHA256: 00
        "};

        assert!(matches!(
            parse_package_index(data.as_bytes(), IndexFormat::Packages),
            Err(RepoSyncError::UnsafePath(path)) if path == "../../etc/passwd"
        ));

        let data = indoc! {"
            Package: foo
            Version: 1
            Architecture: source
            Directory: /srv/pool
            Files:
             00 1 foo_1.dsc
        "};

        assert!(matches!(
            parse_package_index(data.as_bytes(), IndexFormat::Sources),
            Err(RepoSyncError::UnsafePath(_))
        ));
    }

    #[test]
    fn render_is_sorted_and_round_trips() -> Result<()> {
        let entries = parse_package_index(PACKAGES.as_bytes(), IndexFormat::Packages)?;
        let rendered = render_package_index(&entries);

        let text = String::from_utf8(rendered.clone()).unwrap();
        assert!(text.starts_with("Package: bash\n"));
        assert!(text.contains("\n\nPackage: zsh\n"));

        let reparsed = parse_package_index(&rendered, IndexFormat::Packages)?;
        assert_eq!(reparsed.len(), entries.len());
        for entry in &entries {
            assert!(reparsed.contains(entry));
        }

        // Rendering is a fixed point once sorted.
        assert_eq!(render_package_index(&reparsed), rendered);

        // Input order does not matter.
        let reversed = entries.iter().rev().collect::<Vec<_>>();
        assert_eq!(render_package_index(reversed), rendered);

        Ok(())
    }

    #[test]
    fn sources_round_trip() -> Result<()> {
        let entries = parse_package_index(SOURCES.as_bytes(), IndexFormat::Sources)?;
        let rendered = render_package_index(&entries);
        assert_eq!(String::from_utf8(rendered.clone()).unwrap(), SOURCES);
        assert_eq!(parse_package_index(&rendered, IndexFormat::Sources)?, entries);

        Ok(())
    }
}
