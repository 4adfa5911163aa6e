// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `Release` file primitives.

`Release` files (or `InRelease` if it contains a PGP cleartext signature) are
the main definition of a Debian repository. They are a control paragraph that
defines repository-level metadata as well as a list of additional *indices* files
that further define the content of the repository.

[ReleaseDescriptor] represents a parsed `Release` or `InRelease` file. Index files
listed under the various checksum fields are collated into one [ReleaseFileEntry]
per path.

[PackagesFileEntry] and [SourcesFileEntry] are views of a [ReleaseFileEntry] that
has been classified from its path.
*/

use {
    crate::{
        control::{ControlField, ControlFile, ControlParagraph},
        error::{RepoSyncError, Result},
        io::{validate_relative_path, ChecksumType, Compression, ContentDigest, DigestSet},
    },
    chrono::{DateTime, Utc},
    pgp::{armor::BlockType, packet::Packet},
    pgp_cleartext::CleartextSignatureReader,
    std::{borrow::Cow, collections::BTreeMap, io::Read, str::FromStr},
};

/// Formatter string for dates in release files.
pub const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S UTC";

const CLEARTEXT_HEADER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";

/// Fields with a dedicated member on [ReleaseDescriptor].
const KNOWN_FIELDS: &[&str] = &[
    "Origin",
    "Label",
    "Suite",
    "Version",
    "Codename",
    "Date",
    "Valid-Until",
    "Acquire-By-Hash",
    "Architectures",
    "Components",
    "Description",
    "MD5Sum",
    "SHA1",
    "SHA256",
    "SHA512",
];

/// An index file listed by a `Release` file.
///
/// Instances collate the lines for a single path across every checksum field.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReleaseFileEntry {
    /// The path to this file relative to the `Release` file's directory.
    pub path: String,

    /// The size of the file in bytes.
    pub size: u64,

    /// Every digest declared for this file.
    pub digests: DigestSet,
}

impl ReleaseFileEntry {
    /// Obtain the `by-hash` path variant for this entry and a given digest.
    pub fn by_hash_path(&self, digest: &ContentDigest) -> String {
        if let Some((prefix, _)) = self.path.rsplit_once('/') {
            format!(
                "{}/by-hash/{}/{}",
                prefix,
                digest.release_field_name(),
                digest.digest_hex()
            )
        } else {
            format!(
                "by-hash/{}/{}",
                digest.release_field_name(),
                digest.digest_hex()
            )
        }
    }

    /// Attempt to classify this entry as a [PackagesFileEntry].
    pub fn as_packages(&self) -> Option<PackagesFileEntry<'_>> {
        PackagesFileEntry::try_from(self).ok()
    }

    /// Attempt to classify this entry as a [SourcesFileEntry].
    pub fn as_sources(&self) -> Option<SourcesFileEntry<'_>> {
        SourcesFileEntry::try_from(self).ok()
    }
}

/// A [ReleaseFileEntry] that describes a `Packages` file.
#[derive(Clone, Debug, PartialEq)]
pub struct PackagesFileEntry<'a> {
    /// The [ReleaseFileEntry] from which this instance was derived.
    pub entry: &'a ReleaseFileEntry,

    /// The parsed component name (from the entry's path).
    pub component: Cow<'a, str>,

    /// The parsed architecture name (from the entry's path).
    pub architecture: Cow<'a, str>,

    /// File-level compression format being used.
    pub compression: Compression,

    /// Whether this refers to udeb packages used by installers.
    pub is_installer: bool,
}

impl<'a> TryFrom<&'a ReleaseFileEntry> for PackagesFileEntry<'a> {
    type Error = RepoSyncError;

    fn try_from(entry: &'a ReleaseFileEntry) -> std::result::Result<Self, Self::Error> {
        // <component>[/debian-installer]/binary-<arch>/Packages[.ext]
        let (directory, filename) = entry
            .path
            .rsplit_once('/')
            .ok_or(RepoSyncError::ReleaseIndicesEntryWrongType)?;

        let (stem, compression) = Compression::from_filename(filename);
        if stem != "Packages" {
            return Err(RepoSyncError::ReleaseIndicesEntryWrongType);
        }

        let (component, architecture) = directory
            .rsplit_once('/')
            .ok_or(RepoSyncError::ReleaseIndicesEntryWrongType)?;

        let architecture = architecture
            .strip_prefix("binary-")
            .ok_or(RepoSyncError::ReleaseIndicesEntryWrongType)?;

        let (component, is_installer) =
            if let Some(component) = component.strip_suffix("/debian-installer") {
                (component, true)
            } else {
                (component, false)
            };

        Ok(Self {
            entry,
            component: component.into(),
            architecture: architecture.into(),
            compression,
            is_installer,
        })
    }
}

/// A [ReleaseFileEntry] that describes a `Sources` file.
#[derive(Clone, Debug, PartialEq)]
pub struct SourcesFileEntry<'a> {
    /// The [ReleaseFileEntry] from which this instance was derived.
    pub entry: &'a ReleaseFileEntry,

    /// The parsed component name (from the entry's path).
    pub component: Cow<'a, str>,

    /// File-level compression format being used.
    pub compression: Compression,
}

impl<'a> TryFrom<&'a ReleaseFileEntry> for SourcesFileEntry<'a> {
    type Error = RepoSyncError;

    fn try_from(entry: &'a ReleaseFileEntry) -> std::result::Result<Self, Self::Error> {
        // <component>/source/Sources[.ext]
        let (directory, filename) = entry
            .path
            .rsplit_once('/')
            .ok_or(RepoSyncError::ReleaseIndicesEntryWrongType)?;

        let (stem, compression) = Compression::from_filename(filename);
        if stem != "Sources" {
            return Err(RepoSyncError::ReleaseIndicesEntryWrongType);
        }

        let component = directory
            .strip_suffix("/source")
            .ok_or(RepoSyncError::ReleaseIndicesEntryWrongType)?;

        Ok(Self {
            entry,
            component: component.into(),
            compression,
        })
    }
}

/// A signature attached to a `Release` file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReleaseSignature {
    /// The armored signature block of an `InRelease` file.
    Inline(String),
    /// The content of a `Release.gpg` file.
    Detached(Vec<u8>),
}

/// A parsed `Release` or `InRelease` file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReleaseDescriptor {
    pub origin: Option<String>,
    pub label: Option<String>,
    pub suite: Option<String>,
    pub version: Option<String>,
    pub codename: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub description: Option<String>,
    /// Areas within the repository. e.g. `main`, `updates/main`.
    pub components: Vec<String>,
    /// Debian machine architectures. e.g. `all`, `amd64`.
    pub architectures: Vec<String>,
    pub acquire_by_hash: Option<bool>,
    /// Fields without a dedicated member, in file order.
    pub extra_fields: ControlParagraph<'static>,
    /// Index files keyed by path.
    pub entries: BTreeMap<String, ReleaseFileEntry>,
    pub signature: Option<ReleaseSignature>,
}

impl ReleaseDescriptor {
    /// Obtain index files listing binary packages.
    pub fn iter_packages_indices(&self) -> impl Iterator<Item = PackagesFileEntry<'_>> {
        self.entries.values().filter_map(|e| e.as_packages())
    }

    /// Obtain index files listing source packages.
    pub fn iter_sources_indices(&self) -> impl Iterator<Item = SourcesFileEntry<'_>> {
        self.entries.values().filter_map(|e| e.as_sources())
    }

    /// Find the `Packages` index for a component and architecture using the most
    /// preferred compression available.
    pub fn find_packages_index(
        &self,
        component: &str,
        architecture: &str,
    ) -> Option<PackagesFileEntry<'_>> {
        Compression::default_preferred_order().find_map(|compression| {
            self.iter_packages_indices().find(|entry| {
                entry.component == component
                    && entry.architecture == architecture
                    && !entry.is_installer
                    && entry.compression == compression
            })
        })
    }

    /// Find the `Sources` index for a component using the most preferred compression
    /// available.
    pub fn find_sources_index(&self, component: &str) -> Option<SourcesFileEntry<'_>> {
        Compression::default_preferred_order().find_map(|compression| {
            self.iter_sources_indices()
                .find(|entry| entry.component == component && entry.compression == compression)
        })
    }

    /// Record an index file.
    pub fn add_entry(&mut self, path: impl ToString, size: u64, digests: DigestSet) {
        let path = path.to_string();
        self.entries.insert(
            path.clone(),
            ReleaseFileEntry {
                path,
                size,
                digests,
            },
        );
    }
}

/// Read the signed body of a PGP cleartext signed message.
///
/// Dash escaping of the body is reversed and the signatures are returned armored.
/// Signatures are not verified.
fn read_cleartext(data: &[u8]) -> Result<(Vec<u8>, String)> {
    let mut reader = CleartextSignatureReader::new(std::io::Cursor::new(data));

    let mut body = vec![];
    reader
        .read_to_end(&mut body)
        .map_err(|e| RepoSyncError::CleartextMalformed(format!("{}", e)))?;

    let signatures = reader.finalize();

    let mut armored = String::new();
    for signature in signatures.iter_signatures() {
        let packet = Packet::Signature(signature.clone());
        let mut writer = std::io::Cursor::new(Vec::<u8>::new());
        pgp::armor::write(&packet, BlockType::Signature, &mut writer, None)?;

        armored.push_str(&String::from_utf8_lossy(&writer.into_inner()));
    }

    if armored.is_empty() {
        return Err(RepoSyncError::CleartextMalformed("missing signature".into()));
    }

    Ok((body, armored))
}

fn parse_date(paragraph: &ControlParagraph, name: &str) -> Result<Option<DateTime<Utc>>> {
    paragraph.field_datetime_rfc5322(name).transpose()
}

fn words(paragraph: &ControlParagraph, name: &str) -> Vec<String> {
    paragraph
        .iter_field_words(name)
        .map(|words| words.map(|w| w.to_string()).collect())
        .unwrap_or_default()
}

/// Parse a `Release` or `InRelease` file.
///
/// Content beginning with a PGP cleartext signature header is treated as `InRelease`:
/// the signed body is parsed and the armored signature is retained in
/// [ReleaseDescriptor::signature].
pub fn parse_release(data: &[u8]) -> Result<ReleaseDescriptor> {
    let (body, signature) = if data.starts_with(CLEARTEXT_HEADER.as_bytes()) {
        let (body, signature) = read_cleartext(data)?;
        (Cow::Owned(body), Some(ReleaseSignature::Inline(signature)))
    } else {
        (Cow::Borrowed(data), None)
    };

    let mut paragraphs = ControlFile::parse_bytes(&body)?
        .into_paragraphs()
        .collect::<Vec<_>>();

    if paragraphs.len() != 1 {
        return Err(RepoSyncError::ReleaseControlParagraphMismatch(
            paragraphs.len(),
        ));
    }
    let paragraph = paragraphs.remove(0);

    let field = |name: &str| paragraph.field_str(name).map(|v| v.to_string());

    let mut release = ReleaseDescriptor {
        origin: field("Origin"),
        label: field("Label"),
        suite: field("Suite"),
        version: field("Version"),
        codename: field("Codename"),
        date: parse_date(&paragraph, "Date")?,
        valid_until: parse_date(&paragraph, "Valid-Until")?,
        description: field("Description"),
        components: words(&paragraph, "Components"),
        architectures: words(&paragraph, "Architectures"),
        acquire_by_hash: paragraph.field_bool("Acquire-By-Hash"),
        extra_fields: ControlParagraph::default(),
        entries: BTreeMap::new(),
        signature,
    };

    for f in paragraph.iter_fields() {
        if !KNOWN_FIELDS.iter().any(|k| k.eq_ignore_ascii_case(f.name())) {
            release.extra_fields.set_field(f.clone().into_owned());
        }
    }

    for checksum in ChecksumType::preferred_order() {
        let lines = match paragraph.iter_field_lines(checksum.field_name()) {
            Some(lines) => lines,
            None => continue,
        };

        for line in lines {
            // Values are of form: <digest> <size> <path>
            let mut parts = line.split_ascii_whitespace();

            let digest = parts.next().ok_or(RepoSyncError::ReleaseMissingDigest)?;
            let size = parts.next().ok_or(RepoSyncError::ReleaseMissingSize)?;
            let path = parts.next().ok_or(RepoSyncError::ReleaseMissingPath)?;

            if parts.next().is_some() {
                return Err(RepoSyncError::ReleasePathWithSpaces(line.to_string()));
            }

            validate_relative_path(path)?;
            let digest = ContentDigest::from_hex_digest(checksum, digest)?;
            let size = u64::from_str(size)?;

            let entry = release
                .entries
                .entry(path.to_string())
                .or_insert_with(|| ReleaseFileEntry {
                    path: path.to_string(),
                    size,
                    digests: DigestSet::default(),
                });

            if entry.size != size {
                return Err(RepoSyncError::ReleaseConflictingSizes(
                    path.to_string(),
                    entry.size,
                    size,
                ));
            }

            entry.digests.insert(digest);
        }
    }

    Ok(release)
}

/// Build the control paragraph for a [ReleaseDescriptor].
pub fn release_paragraph(release: &ReleaseDescriptor) -> ControlParagraph<'static> {
    let mut para = ControlParagraph::default();

    let mut set = |name: &'static str, value: String| {
        para.set_field(ControlField::new(name.into(), value.into()));
    };

    if let Some(v) = &release.origin {
        set("Origin", v.clone());
    }
    if let Some(v) = &release.label {
        set("Label", v.clone());
    }
    if let Some(v) = &release.suite {
        set("Suite", v.clone());
    }
    if let Some(v) = &release.version {
        set("Version", v.clone());
    }
    if let Some(v) = &release.codename {
        set("Codename", v.clone());
    }
    if let Some(v) = &release.date {
        set("Date", format!("{}", v.format(DATE_FORMAT)));
    }
    if let Some(v) = &release.valid_until {
        set("Valid-Until", format!("{}", v.format(DATE_FORMAT)));
    }
    if let Some(v) = release.acquire_by_hash {
        set("Acquire-By-Hash", if v { "yes" } else { "no" }.to_string());
    }
    if !release.architectures.is_empty() {
        set("Architectures", release.architectures.join(" "));
    }
    if !release.components.is_empty() {
        set("Components", release.components.join(" "));
    }
    if let Some(v) = &release.description {
        set("Description", v.clone());
    }

    let mut extras = release.extra_fields.iter_fields().collect::<Vec<_>>();
    extras.sort_by(|a, b| a.name().cmp(b.name()));
    for field in extras {
        para.set_field(field.clone());
    }

    // Sizes are right aligned per field, as apt-ftparchive does.
    for checksum in [
        ChecksumType::Md5,
        ChecksumType::Sha1,
        ChecksumType::Sha256,
        ChecksumType::Sha512,
    ] {
        let entries = release
            .entries
            .values()
            .filter_map(|entry| entry.digests.get(checksum).map(|d| (entry, d)))
            .collect::<Vec<_>>();

        if entries.is_empty() {
            continue;
        }

        let longest_size = entries
            .iter()
            .map(|(entry, _)| entry.size.to_string().len())
            .max()
            .unwrap_or_default();

        para.set_field(ControlField::from_lines(
            checksum.field_name().into(),
            entries.into_iter().map(|(entry, digest)| {
                format!(
                    "{} {:>size_width$} {}",
                    digest.digest_hex(),
                    entry.size,
                    entry.path,
                    size_width = longest_size
                )
            }),
        ));
    }

    para
}

/// Serialize a [ReleaseDescriptor] to `Release` file content.
///
/// Fields are emitted in a canonical order and index entries are sorted by path,
/// so equal descriptors always render to identical bytes. Any signature is not
/// part of the output.
pub fn render_release(release: &ReleaseDescriptor) -> Vec<u8> {
    let mut buffer = vec![];
    // Writing to a Vec cannot fail.
    let _ = release_paragraph(release).write(&mut buffer);

    buffer
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::signing::{test::test_signer, ReleaseSigner},
        chrono::TimeZone,
        indoc::indoc,
    };

    const RELEASE: &str = indoc! {"
        Origin: Debian
        Label: Debian
        Suite: stable
        Version: 11.1
        Codename: bullseye
        Date: Sat, 09 Oct 2021 09:34:56 UTC
        Acquire-By-Hash: yes
        No-Support-for-Architecture-all: Packages
        Architectures: all amd64 arm64
        Components: main contrib
        Description: Debian 11.1 Released 09 October 2021
        MD5Sum:
         7fdf4db15250af5368cc52a91e8edbce   738242 contrib/Contents-all
         cbd7bc4d3eb517ac2b22f929dfc07b47    57319 main/binary-amd64/Packages.xz
         e3830f6fc5a946b5a5b46e8277e1d86f    80488 main/source/Sources.xz
        SHA256:
         3957f28db16e3f28c7b34ae84f1c929c567de6970f3f1b95dac9b498dd80fe63   738242 contrib/Contents-all
         3e9a121d599b56c08bc8f144e4830807c77c29d7114316d6984ba54695d3db7b    57319 main/binary-amd64/Packages.xz
         30f3f996941badb983141e3b29b2ed5941d28cf81f9b5f600bb48f782d386fc7    80488 main/source/Sources.xz
    "};

    #[test]
    fn parse_plain_release() -> Result<()> {
        let release = parse_release(RELEASE.as_bytes())?;

        assert_eq!(release.origin.as_deref(), Some("Debian"));
        assert_eq!(release.suite.as_deref(), Some("stable"));
        assert_eq!(release.codename.as_deref(), Some("bullseye"));
        assert_eq!(release.version.as_deref(), Some("11.1"));
        assert_eq!(
            release.date,
            Some(Utc.with_ymd_and_hms(2021, 10, 9, 9, 34, 56).unwrap())
        );
        assert_eq!(release.components, vec!["main", "contrib"]);
        assert_eq!(release.architectures, vec!["all", "amd64", "arm64"]);
        assert_eq!(release.acquire_by_hash, Some(true));
        assert_eq!(
            release
                .extra_fields
                .field_str("No-Support-for-Architecture-all"),
            Some("Packages")
        );
        assert!(release.signature.is_none());

        assert_eq!(release.entries.len(), 3);
        let entry = &release.entries["main/binary-amd64/Packages.xz"];
        assert_eq!(entry.size, 57319);
        assert_eq!(entry.digests.iter().count(), 2);
        assert_eq!(
            entry.digests.strongest().unwrap().digest_hex(),
            "3e9a121d599b56c08bc8f144e4830807c77c29d7114316d6984ba54695d3db7b"
        );
        assert_eq!(
            entry.by_hash_path(entry.digests.strongest().unwrap()),
            "main/binary-amd64/by-hash/SHA256/3e9a121d599b56c08bc8f144e4830807c77c29d7114316d6984ba54695d3db7b"
        );

        Ok(())
    }

    #[test]
    fn classify_indices() -> Result<()> {
        let release = parse_release(RELEASE.as_bytes())?;

        let packages = release.find_packages_index("main", "amd64").unwrap();
        assert_eq!(packages.compression, Compression::Xz);
        assert_eq!(packages.entry.path, "main/binary-amd64/Packages.xz");
        assert!(release.find_packages_index("contrib", "amd64").is_none());

        let sources = release.find_sources_index("main").unwrap();
        assert_eq!(sources.compression, Compression::Xz);
        assert_eq!(release.iter_packages_indices().count(), 1);

        let entry = ReleaseFileEntry {
            path: "main/debian-installer/binary-arm64/Packages.gz".into(),
            size: 1,
            digests: DigestSet::default(),
        };
        let packages = entry.as_packages().unwrap();
        assert_eq!(packages.component, "main");
        assert_eq!(packages.architecture, "arm64");
        assert!(packages.is_installer);

        let entry = ReleaseFileEntry {
            path: "updates/main/source/Sources".into(),
            size: 1,
            digests: DigestSet::default(),
        };
        assert_eq!(entry.as_sources().unwrap().component, "updates/main");
        assert!(entry.as_packages().is_none());

        Ok(())
    }

    #[test]
    fn parse_inrelease() -> Result<()> {
        let content = indoc! {"
            Origin: Example
            Suite: stable
            -Dashed-Field: value
            SHA256:
             3957f28db16e3f28c7b34ae84f1c929c567de6970f3f1b95dac9b498dd80fe63 10 main/binary-amd64/Packages
        "};

        let (signer, _) = test_signer();
        let signed = signer.sign_inline(content.as_bytes())?;
        assert!(String::from_utf8_lossy(&signed).contains("\n- -Dashed-Field: value\n"));

        let mut release = parse_release(&signed)?;
        assert_eq!(release.origin.as_deref(), Some("Example"));
        assert_eq!(release.extra_fields.field_str("-Dashed-Field"), Some("value"));
        assert_eq!(release.entries.len(), 1);
        assert!(matches!(
            &release.signature,
            Some(ReleaseSignature::Inline(armored))
                if armored.starts_with("-----BEGIN PGP SIGNATURE-----")
        ));

        release.signature = None;
        assert_eq!(release, parse_release(content.as_bytes())?);

        Ok(())
    }

    #[test]
    fn malformed_inputs() {
        assert!(matches!(
            parse_release(b"-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA256\n\nOrigin: x\n"),
            Err(RepoSyncError::CleartextMalformed(_))
        ));
        assert!(matches!(
            parse_release(b"Origin: a\n\nOrigin: b\n"),
            Err(RepoSyncError::ReleaseControlParagraphMismatch(2))
        ));
        assert!(matches!(
            parse_release(b"SHA256:\n 00 10\n"),
            Err(RepoSyncError::ReleaseMissingPath)
        ));

        let conflicting = indoc! {"
            MD5Sum:
             7fdf4db15250af5368cc52a91e8edbce 10 main/binary-amd64/Packages
            SHA256:
             3957f28db16e3f28c7b34ae84f1c929c567de6970f3f1b95dac9b498dd80fe63 11 main/binary-amd64/Packages
        "};
        assert!(matches!(
            parse_release(conflicting.as_bytes()),
            Err(RepoSyncError::ReleaseConflictingSizes(_, _, _))
        ));
    }

    #[test]
    fn render_round_trip() -> Result<()> {
        let release = parse_release(RELEASE.as_bytes())?;
        let rendered = render_release(&release);

        let reparsed = parse_release(&rendered)?;
        assert_eq!(reparsed, release);
        assert_eq!(render_release(&reparsed), rendered);

        let text = String::from_utf8(rendered).unwrap();
        assert!(text.starts_with("Origin: Debian\nLabel: Debian\nSuite: stable\n"));
        assert!(text.contains(
            "MD5Sum:\n 7fdf4db15250af5368cc52a91e8edbce 738242 contrib/Contents-all\n cbd7bc4d3eb517ac2b22f929dfc07b47  57319 main/binary-amd64/Packages.xz\n"
        ));
        assert!(!text.contains("SHA512"));

        Ok(())
    }
}
