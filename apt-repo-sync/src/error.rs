// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use {
    crate::{io::ChecksumType, planner::SyncState},
    thiserror::Error,
};

/// Broad classification of a [RepoSyncError].
///
/// Hosts use this to decide how to surface a failure. Only
/// [ErrorCategory::Network] failures are worth retrying.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum ErrorCategory {
    /// Malformed or unparseable metadata.
    #[strum(serialize = "format")]
    Format,
    /// Fetched content did not match its declared size or digest.
    #[strum(serialize = "validation")]
    Validation,
    /// Remote unreachable or a fetch failed.
    #[strum(serialize = "network")]
    Network,
    /// A publication could not be produced.
    #[strum(serialize = "publish")]
    Publish,
    /// Local storage failed.
    #[strum(serialize = "storage")]
    Storage,
    /// The operation was cancelled.
    #[strum(serialize = "cancelled")]
    Cancelled,
}

/// Describes fetched content not matching what the metadata declared.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ValidationError {
    #[error("size mismatch for {path}: expected {expected} bytes; got {actual}")]
    Size {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("{checksum} mismatch for {path}: expected {expected}; got {actual}")]
    Checksum {
        path: String,
        checksum: ChecksumType,
        expected: String,
        actual: String,
    },
}

impl ValidationError {
    /// The dimension that failed validation: `size` or `checksum`.
    pub fn dimension(&self) -> &'static str {
        match self {
            Self::Size { .. } => "size",
            Self::Checksum { .. } => "checksum",
        }
    }

    /// The repository relative path of the content that failed validation.
    pub fn path(&self) -> &str {
        match self {
            Self::Size { path, .. } => path,
            Self::Checksum { path, .. } => path,
        }
    }
}

/// A failure reading content from a remote, carried through [std::io::Error].
#[derive(Debug, Error)]
#[error("repository I/O error on path {path}: {source}")]
pub struct RemoteReadError {
    pub path: String,
    #[source]
    pub source: std::io::Error,
}

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum RepoSyncError {
    #[error("URL error: {0:?}")]
    Url(#[from] url::ParseError),

    #[error("hex parsing error: {0:?}")]
    Hex(#[from] hex::FromHexError),

    #[error("PGP error: {0:?}")]
    Pgp(#[from] pgp::errors::Error),

    #[error("date parsing error: {0:?}")]
    DateParse(#[from] mailparse::MailParseError),

    #[cfg(feature = "http")]
    #[error("HTTP error: {0:?}")]
    Reqwest(#[from] reqwest::Error),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0:?}")]
    Json(#[from] serde_json::Error),

    #[error("integer parsing error: {0:?}")]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("control file parse error: {0}")]
    ControlParseError(String),

    #[error("control data is not valid UTF-8")]
    ControlNotUtf8,

    #[error("required field missing in {0} paragraph: {1}")]
    MissingField(&'static str, &'static str),

    #[error("{0} paragraph for {1} declares no checksums (expected one of MD5sum, SHA1, SHA256, SHA512)")]
    MissingChecksums(&'static str, String),

    #[error("malformed {0} field: {1}")]
    MalformedField(&'static str, String),

    #[error("invalid hex digest {0}: {1:?}")]
    ContentDigestBadHex(String, hex::FromHexError),

    #[error("unknown checksum type: {0}")]
    UnknownChecksumType(String),

    #[error("expected 1 paragraph in release file; got {0}")]
    ReleaseControlParagraphMismatch(usize),

    #[error("digest missing from index entry")]
    ReleaseMissingDigest,

    #[error("size missing from index entry")]
    ReleaseMissingSize,

    #[error("path missing from index entry")]
    ReleaseMissingPath,

    #[error("index entry path unexpectedly has spaces: {0}")]
    ReleasePathWithSpaces(String),

    #[error("index entry {0} declares conflicting sizes {1} and {2}")]
    ReleaseConflictingSizes(String, u64, u64),

    #[error("release file does not contain supported checksum flavor")]
    ReleaseNoKnownChecksum,

    #[error("release file lacks an index for {0}")]
    ReleaseIndexNotFound(String),

    #[error("malformed PGP cleartext signed message: {0}")]
    CleartextMalformed(String),

    #[error("path escapes the repository root: {0}")]
    UnsafePath(String),

    #[error("indices entry not of expected type")]
    ReleaseIndicesEntryWrongType,

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("repository path not found: {0}")]
    RemotePathNotFound(String),

    #[error("repository I/O error on path {0}: {1:?}")]
    RemoteIoPath(String, std::io::Error),

    #[error("unsupported repository URL: {0}")]
    UnsupportedRemote(String),

    #[error("artifact not found in store: {0}")]
    ArtifactNotFound(String),

    #[error("storage I/O error on path {0}: {1:?}")]
    StorageIoPath(String, std::io::Error),

    #[error("no content unit supplied for addition of {0}")]
    MissingContentUnit(String),

    #[error("repository version {1} of {0} does not exist")]
    UnknownRepositoryVersion(String, u64),

    #[error("repository {repository} moved from version {expected:?} to {actual:?}")]
    VersionConflict {
        repository: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("invalid sync state transition from {0} to {1}")]
    InvalidStateTransition(SyncState, SyncState),

    #[error("sync cancelled")]
    Cancelled,

    #[error("verbatim publication requires a repository version created by a mirror sync")]
    VerbatimRequiresMirror,

    #[error("retained metadata missing for {0}")]
    MissingRetainedMetadata(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("publication mode {0} requires at least one component")]
    PublishNoComponents(&'static str),

    #[error("pool path {0} is claimed by differing content ({1} and {2})")]
    PoolPathConflict(String, String, String),
}

impl RepoSyncError {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Hex(_)
            | Self::DateParse(_)
            | Self::ParseInt(_)
            | Self::ControlParseError(_)
            | Self::ControlNotUtf8
            | Self::MissingField(_, _)
            | Self::MissingChecksums(_, _)
            | Self::MalformedField(_, _)
            | Self::ContentDigestBadHex(_, _)
            | Self::UnknownChecksumType(_)
            | Self::ReleaseControlParagraphMismatch(_)
            | Self::ReleaseMissingDigest
            | Self::ReleaseMissingSize
            | Self::ReleaseMissingPath
            | Self::ReleasePathWithSpaces(_)
            | Self::ReleaseConflictingSizes(_, _, _)
            | Self::ReleaseNoKnownChecksum
            | Self::ReleaseIndexNotFound(_)
            | Self::CleartextMalformed(_)
            | Self::UnsafePath(_)
            | Self::ReleaseIndicesEntryWrongType
            | Self::UnsupportedRemote(_) => ErrorCategory::Format,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Url(_)
            | Self::RemotePathNotFound(_)
            | Self::RemoteIoPath(_, _) => ErrorCategory::Network,
            #[cfg(feature = "http")]
            Self::Reqwest(_) => ErrorCategory::Network,
            Self::Pgp(_)
            | Self::VerbatimRequiresMirror
            | Self::MissingRetainedMetadata(_)
            | Self::Signing(_)
            | Self::PublishNoComponents(_)
            | Self::PoolPathConflict(_, _, _) => ErrorCategory::Publish,
            Self::Io(_)
            | Self::Json(_)
            | Self::ArtifactNotFound(_)
            | Self::StorageIoPath(_, _)
            | Self::MissingContentUnit(_)
            | Self::UnknownRepositoryVersion(_, _)
            | Self::VersionConflict { .. }
            | Self::InvalidStateTransition(_, _) => ErrorCategory::Storage,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Whether a host may reasonably retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Network
    }

    /// Convert an error raised by a reader of fetched content.
    ///
    /// Validation failures and remote read failures carried inside the
    /// [std::io::Error] are unwrapped. Anything else is an I/O error.
    pub fn from_read_error(e: std::io::Error) -> Self {
        let wrapped = e
            .get_ref()
            .map(|inner| inner.is::<ValidationError>() || inner.is::<RemoteReadError>())
            .unwrap_or(false);

        if !wrapped {
            return Self::Io(e);
        }

        let kind = e.kind();
        match e.into_inner().map(|inner| inner.downcast::<ValidationError>()) {
            Some(Ok(validation)) => Self::Validation(*validation),
            Some(Err(inner)) => match inner.downcast::<RemoteReadError>() {
                Ok(read) => Self::RemoteIoPath(read.path, read.source),
                Err(inner) => Self::Io(std::io::Error::new(kind, inner)),
            },
            None => Self::Io(kind.into()),
        }
    }

    /// Obtain the inner [ValidationError], if this is a validation failure.
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation(e) => Some(e),
            _ => None,
        }
    }
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, RepoSyncError>;
