// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! I/O helpers. */

use {
    crate::error::{RemoteReadError, RepoSyncError, Result, ValidationError},
    async_compression::futures::bufread::{
        BzDecoder, BzEncoder, GzipDecoder, GzipEncoder, LzmaDecoder, LzmaEncoder, XzDecoder,
        XzEncoder,
    },
    async_trait::async_trait,
    digest::DynDigest,
    futures::{AsyncBufRead, AsyncRead, AsyncReadExt},
    serde::{Deserialize, Deserializer, Serialize, Serializer},
    std::{
        collections::BTreeMap,
        fmt::Formatter,
        path::{Component, Path},
        pin::Pin,
        str::FromStr,
        task::{Context, Poll},
    },
};

/// Checksum type / digest mechanism used in repository metadata.
///
/// Variants are ordered from weakest to strongest.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChecksumType {
    /// MD5.
    Md5,

    /// SHA-1.
    Sha1,

    /// SHA-256.
    Sha256,

    /// SHA-512.
    Sha512,
}

impl ChecksumType {
    /// Emit variants in their preferred usage order, strongest first.
    pub fn preferred_order() -> impl Iterator<Item = ChecksumType> {
        [Self::Sha512, Self::Sha256, Self::Sha1, Self::Md5].into_iter()
    }

    /// Name of the control field in `Release` files holding this variant type.
    ///
    /// This also corresponds to the directory name for `by-hash` paths.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5Sum",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    /// Name of the field in `Packages` paragraphs holding this variant type.
    pub fn packages_field_name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5sum",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    /// Name of the field in `Sources` paragraphs listing files with this variant type.
    pub fn sources_field_name(&self) -> &'static str {
        match self {
            Self::Md5 => "Files",
            Self::Sha1 => "Checksums-Sha1",
            Self::Sha256 => "Checksums-Sha256",
            Self::Sha512 => "Checksums-Sha512",
        }
    }

    /// Obtain a new hasher for this checksum flavor.
    pub fn new_hasher(&self) -> Box<dyn DynDigest + Send> {
        match self {
            Self::Md5 => Box::new(md5::Md5::default()),
            Self::Sha1 => Box::new(sha1::Sha1::default()),
            Self::Sha256 => Box::new(sha2::Sha256::default()),
            Self::Sha512 => Box::new(sha2::Sha512::default()),
        }
    }

    /// Compute the digest of a buffer.
    pub fn digest_data(&self, data: &[u8]) -> ContentDigest {
        let mut hasher = self.new_hasher();
        hasher.update(data);

        ContentDigest::new(*self, hasher.finalize().into_vec())
    }
}

/// Represents a content digest.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ContentDigest {
    checksum: ChecksumType,
    digest: Vec<u8>,
}

impl std::fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.checksum, self.digest_hex())
    }
}

impl FromStr for ContentDigest {
    type Err = RepoSyncError;

    fn from_str(s: &str) -> Result<Self> {
        let (checksum, digest) = s
            .split_once(':')
            .ok_or_else(|| RepoSyncError::UnknownChecksumType(s.to_string()))?;
        let checksum = ChecksumType::from_str(checksum)
            .map_err(|_| RepoSyncError::UnknownChecksumType(checksum.to_string()))?;

        Self::from_hex_digest(checksum, digest)
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;

        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl ContentDigest {
    /// Construct an instance from raw digest bytes.
    pub fn new(checksum: ChecksumType, digest: Vec<u8>) -> Self {
        Self { checksum, digest }
    }

    /// Obtain an instance by parsing a hex string as a [ChecksumType].
    pub fn from_hex_digest(checksum: ChecksumType, digest: &str) -> Result<Self> {
        let digest = hex::decode(digest)
            .map_err(|e| RepoSyncError::ContentDigestBadHex(digest.to_string(), e))?;

        Ok(Self { checksum, digest })
    }

    /// Obtain the digest bytes for this content digest.
    pub fn digest_bytes(&self) -> &[u8] {
        &self.digest
    }

    /// Obtain the hex encoded content digest.
    pub fn digest_hex(&self) -> String {
        hex::encode(&self.digest)
    }

    /// Obtain the [ChecksumType] for this digest.
    pub fn checksum_type(&self) -> ChecksumType {
        self.checksum
    }

    /// Obtain the name of the field in `[In]Release` files that holds this digest type.
    pub fn release_field_name(&self) -> &'static str {
        self.checksum.field_name()
    }
}

/// A collection of digests of the same content, at most one per [ChecksumType].
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(from = "Vec<ContentDigest>", into = "Vec<ContentDigest>")]
pub struct DigestSet {
    digests: BTreeMap<ChecksumType, ContentDigest>,
}

impl DigestSet {
    /// Compute every supported digest of a buffer.
    pub fn digest_data(data: &[u8]) -> Self {
        let mut digester = MultiDigester::default();
        digester.update(data);
        digester.finish()
    }

    /// Record a digest, replacing any prior digest of the same type.
    pub fn insert(&mut self, digest: ContentDigest) {
        self.digests.insert(digest.checksum_type(), digest);
    }

    /// Obtain the digest of a given type.
    pub fn get(&self, checksum: ChecksumType) -> Option<&ContentDigest> {
        self.digests.get(&checksum)
    }

    /// Obtain the strongest digest held.
    pub fn strongest(&self) -> Option<&ContentDigest> {
        ChecksumType::preferred_order().find_map(|checksum| self.digests.get(&checksum))
    }

    /// Whether no digests are held.
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Iterate over held digests, weakest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ContentDigest> + '_ {
        self.digests.values()
    }
}

impl From<Vec<ContentDigest>> for DigestSet {
    fn from(v: Vec<ContentDigest>) -> Self {
        v.into_iter().collect()
    }
}

impl From<DigestSet> for Vec<ContentDigest> {
    fn from(v: DigestSet) -> Self {
        v.digests.into_values().collect()
    }
}

impl FromIterator<ContentDigest> for DigestSet {
    fn from_iter<T: IntoIterator<Item = ContentDigest>>(iter: T) -> Self {
        let mut set = Self::default();
        for digest in iter {
            set.insert(digest);
        }

        set
    }
}

/// A content digester that simultaneously computes every supported digest type.
pub struct MultiDigester {
    hashers: Vec<(ChecksumType, Box<dyn DynDigest + Send>)>,
}

impl Default for MultiDigester {
    fn default() -> Self {
        use strum::IntoEnumIterator;

        Self {
            hashers: ChecksumType::iter()
                .map(|checksum| (checksum, checksum.new_hasher()))
                .collect(),
        }
    }
}

impl MultiDigester {
    /// Write content into the digesters.
    pub fn update(&mut self, data: &[u8]) {
        for (_, hasher) in self.hashers.iter_mut() {
            hasher.update(data);
        }
    }

    /// Finish digesting content.
    ///
    /// Consumes the instance and returns a [DigestSet] holding all the digests.
    pub fn finish(self) -> DigestSet {
        self.hashers
            .into_iter()
            .map(|(checksum, hasher)| ContentDigest::new(checksum, hasher.finalize().into_vec()))
            .collect()
    }
}

/// Compression format used by repository indices.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Compression {
    /// No compression (no extension).
    None,

    /// XZ compression (.xz extension).
    Xz,

    /// Gzip compression (.gz extension).
    Gzip,

    /// Bzip2 compression (.bz2 extension).
    Bzip2,

    /// LZMA compression (.lzma extension).
    Lzma,
}

impl Compression {
    /// Filename extension for files compressed in this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Xz => ".xz",
            Self::Gzip => ".gz",
            Self::Bzip2 => ".bz2",
            Self::Lzma => ".lzma",
        }
    }

    /// Resolve the compression of a filename from its extension.
    ///
    /// Returns the filename stem alongside the detected compression.
    pub fn from_filename(filename: &str) -> (&str, Self) {
        [Self::Xz, Self::Gzip, Self::Bzip2, Self::Lzma]
            .into_iter()
            .find_map(|c| filename.strip_suffix(c.extension()).map(|stem| (stem, c)))
            .unwrap_or((filename, Self::None))
    }

    /// The default retrieval preference order for client.
    pub fn default_preferred_order() -> impl Iterator<Item = Compression> {
        [Self::Xz, Self::Gzip, Self::Bzip2, Self::Lzma, Self::None].into_iter()
    }
}

/// Wrap a reader with transparent decompression.
pub fn read_decompressed<'a>(
    stream: impl AsyncBufRead + Send + 'a,
    compression: Compression,
) -> Pin<Box<dyn AsyncRead + Send + 'a>> {
    match compression {
        Compression::None => Box::pin(stream),
        Compression::Gzip => Box::pin(GzipDecoder::new(stream)),
        Compression::Xz => Box::pin(XzDecoder::new(stream)),
        Compression::Bzip2 => Box::pin(BzDecoder::new(stream)),
        Compression::Lzma => Box::pin(LzmaDecoder::new(stream)),
    }
}

/// Wrap a reader with transparent compression.
pub fn read_compressed<'a>(
    stream: impl AsyncBufRead + Send + 'a,
    compression: Compression,
) -> Pin<Box<dyn AsyncRead + Send + 'a>> {
    match compression {
        Compression::None => Box::pin(stream),
        Compression::Gzip => Box::pin(GzipEncoder::new(stream)),
        Compression::Xz => Box::pin(XzEncoder::new(stream)),
        Compression::Bzip2 => Box::pin(BzEncoder::new(stream)),
        Compression::Lzma => Box::pin(LzmaEncoder::new(stream)),
    }
}

/// Compress a buffer.
pub async fn compress_bytes(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    let mut reader = read_compressed(futures::io::Cursor::new(data), compression);
    let mut buf = vec![];
    reader.read_to_end(&mut buf).await?;

    Ok(buf)
}

/// Decompress a buffer.
pub async fn decompress_bytes(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    let mut reader = read_decompressed(futures::io::Cursor::new(data), compression);
    let mut buf = vec![];
    reader.read_to_end(&mut buf).await?;

    Ok(buf)
}

/// Ensure a repository relative path stays within the repository.
///
/// Empty and absolute paths are rejected, as are paths with empty, `.` or `..`
/// components.
pub fn validate_relative_path(path: &str) -> Result<&str> {
    let normal = !path.is_empty()
        && !path.contains(|c| c == '\\' || c == '\0')
        && path
            .split('/')
            .all(|c| !c.is_empty() && c != "." && c != "..")
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));

    if normal {
        Ok(path)
    } else {
        Err(RepoSyncError::UnsafePath(path.to_string()))
    }
}

/// An [AsyncRead] wrapper that validates content as it is read.
///
/// Once the source reaches EOF the observed size and digest are compared against
/// expected values. A mismatch surfaces as an [std::io::Error] of kind
/// `InvalidData` wrapping a [ValidationError]. Errors from the source are wrapped
/// in a [RemoteReadError] naming the path being read.
pub struct ContentValidatingReader<R> {
    source: R,
    path: String,
    expected_size: u64,
    expected_digest: ContentDigest,
    hasher: Option<Box<dyn DynDigest + Send>>,
    bytes_read: u64,
}

impl<R> ContentValidatingReader<R> {
    /// Wrap a reader, expecting it to yield `expected_size` bytes hashing to `expected_digest`.
    pub fn new(
        source: R,
        path: impl ToString,
        expected_size: u64,
        expected_digest: ContentDigest,
    ) -> Self {
        Self {
            source,
            path: path.to_string(),
            expected_size,
            hasher: Some(expected_digest.checksum_type().new_hasher()),
            expected_digest,
            bytes_read: 0,
        }
    }

    fn finish(&self, hasher: Box<dyn DynDigest + Send>) -> std::result::Result<(), ValidationError> {
        if self.bytes_read != self.expected_size {
            return Err(ValidationError::Size {
                path: self.path.clone(),
                expected: self.expected_size,
                actual: self.bytes_read,
            });
        }

        let actual = hasher.finalize();
        if actual.as_ref() != self.expected_digest.digest_bytes() {
            return Err(ValidationError::Checksum {
                path: self.path.clone(),
                checksum: self.expected_digest.checksum_type(),
                expected: self.expected_digest.digest_hex(),
                actual: hex::encode(actual),
            });
        }

        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ContentValidatingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = &mut *self;

        match Pin::new(&mut this.source).poll_read(cx, buf) {
            Poll::Ready(Ok(0)) => match this.hasher.take() {
                Some(hasher) => match this.finish(hasher) {
                    Ok(()) => Poll::Ready(Ok(0)),
                    Err(e) => Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        e,
                    ))),
                },
                None => Poll::Ready(Ok(0)),
            },
            Poll::Ready(Ok(size)) => {
                if let Some(hasher) = this.hasher.as_mut() {
                    hasher.update(&buf[..size]);
                }
                this.bytes_read += size as u64;

                Poll::Ready(Ok(size))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(std::io::Error::new(
                e.kind(),
                RemoteReadError {
                    path: this.path.clone(),
                    source: e,
                },
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Generic mechanism for obtaining content at a given path.
///
/// This trait is used to define a generic mechanism for resolving content given
/// a lookup key/path. Paths are relative to the root of a repository.
///
/// Implementations only need to implement `get_path()`. A missing path should
/// produce [RepoSyncError::RemotePathNotFound].
#[async_trait]
pub trait DataResolver: Sync {
    /// Get the content of a relative path as an async reader.
    ///
    /// This obtains a reader for path data and returns the raw data without any
    /// decoding applied.
    async fn get_path(&self, path: &str) -> Result<Pin<Box<dyn AsyncRead + Send>>>;

    /// Read the full content of a relative path into memory.
    async fn get_path_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let mut reader = self.get_path(path).await?;
        let mut buf = vec![];
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| RepoSyncError::RemoteIoPath(path.to_string(), e))?;

        Ok(buf)
    }

    /// Read the content of a relative path, tolerating its absence.
    async fn get_path_bytes_optional(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.get_path_bytes(path).await {
            Ok(data) => Ok(Some(data)),
            Err(RepoSyncError::RemotePathNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
