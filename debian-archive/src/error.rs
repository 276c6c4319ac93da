// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use {
    crate::{hash::HashAlgorithm, package_version::VersionError},
    thiserror::Error,
};

/// Content did not match the digest or size it was declared with.
///
/// Streaming adapters carry this inside a [std::io::Error]. Converting that I/O error
/// into an [ArchiveError] recovers it as [ArchiveError::HashMismatch].
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum IntegrityError {
    #[error("{path}: {algorithm} digest mismatch; expected {expected}, got {actual}")]
    Digest {
        path: String,
        algorithm: HashAlgorithm,
        expected: String,
        actual: String,
    },

    #[error("{path}: size mismatch; expected {expected} bytes, got {actual}")]
    Size {
        path: String,
        expected: u64,
        actual: u64,
    },
}

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),

    #[error("I/O error on path {0}: {1:?}")]
    IoPath(String, std::io::Error),

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
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("integer parsing error: {0:?}")]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("version error: {0}")]
    Version(#[from] VersionError),

    #[error("control file parse error: {0}")]
    ControlParseError(String),

    #[error("required field missing in {0} paragraph: {1}")]
    ControlRequiredFieldMissing(&'static str, &'static str),

    #[error("no PGP signing key is configured")]
    NoSigningKey,

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("malformed cleartext signature: {0}")]
    CleartextMalformed(String),

    #[error("signature verification failed: {0}")]
    SignatureVerification(String),

    #[error("unsupported hash algorithm: {0}")]
    UnsupportedHashAlgorithm(String),

    #[error("unsupported compression: {0}")]
    UnsupportedCompression(String),

    #[error("no strong digest declared for index {0}")]
    UndeclaredIndex(String),

    #[error("integrity check failed: {0}")]
    HashMismatch(IntegrityError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out fetching {0}")]
    Timeout(String),

    #[error("unknown component: {0}")]
    UnknownComponent(String),

    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),

    #[error("unknown source package: {0}")]
    UnknownSource(String),

    #[error("no version of {0} satisfies {1}")]
    NoSatisfyingVersion(String, String),

    #[error("source package relation cannot carry an architecture qualifier: {0}")]
    SourcePossibilityHasArchitecture(String),

    #[error("failed to parse dependency expression: {0}")]
    DependencyParse(String),

    #[error("expected 1 paragraph in Release file; got {0}")]
    ReleaseControlParagraphMismatch(usize),

    #[error("digest missing from index entry")]
    ReleaseMissingDigest,

    #[error("size missing from index entry")]
    ReleaseMissingSize,

    #[error("path missing from index entry")]
    ReleaseMissingPath,

    #[error("index entry path unexpectedly has spaces: {0}")]
    ReleasePathWithSpaces(String),

    #[error("unknown entry in binary package archive: {0}")]
    DebUnknownBinaryPackageEntry(String),

    #[error("unknown compression in deb archive file: {0}")]
    DebUnknownCompression(String),

    #[error("control file not found in deb archive")]
    DebControlFileNotFound,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("linking {failed} failed after {} paths were swapped: {source}", .linked.len())]
    LinkIncomplete {
        failed: String,
        linked: Vec<String>,
        source: Box<ArchiveError>,
    },

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for ArchiveError {
    fn from(e: std::io::Error) -> Self {
        let integrity = e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<IntegrityError>())
            .cloned();

        match integrity {
            Some(integrity) => Self::HashMismatch(integrity),
            None => Self::Io(e),
        }
    }
}

impl From<IntegrityError> for ArchiveError {
    fn from(e: IntegrityError) -> Self {
        Self::HashMismatch(e)
    }
}

impl ArchiveError {
    /// Whether the failure is a server side or connectivity fault worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => (500..=599).contains(status),
            #[cfg(feature = "http")]
            Self::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.is_body()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            Self::Timeout(_) => true,
            Self::Io(e) | Self::IoPath(_, e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Whether the failure means the requested path does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::HttpStatus { status, .. } => *status == 404 || *status == 410,
            Self::Io(e) | Self::IoPath(_, e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, ArchiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_error_survives_io_round_trip() {
        let integrity = IntegrityError::Size {
            path: "main/binary-amd64/Packages".into(),
            expected: 10,
            actual: 11,
        };

        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, integrity.clone());
        match ArchiveError::from(io) {
            ArchiveError::HashMismatch(e) => assert_eq!(e, integrity),
            e => panic!("unexpected error: {:?}", e),
        }

        let plain = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = ArchiveError::from(plain);
        assert!(matches!(err, ArchiveError::Io(_)));
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[test]
    fn transient_classification() {
        let server = ArchiveError::HttpStatus {
            url: "https://example.com/dists/test/InRelease".into(),
            status: 503,
        };
        assert!(server.is_transient());

        let missing = ArchiveError::HttpStatus {
            url: "https://example.com/dists/test/InRelease".into(),
            status: 404,
        };
        assert!(!missing.is_transient());
        assert!(missing.is_not_found());

        for status in [500, 599] {
            assert!(ArchiveError::HttpStatus { url: "x".into(), status }.is_transient());
        }
        for status in [600, 999] {
            assert!(!ArchiveError::HttpStatus { url: "x".into(), status }.is_transient());
        }

        assert!(ArchiveError::Timeout("x".into()).is_transient());
        assert!(!ArchiveError::SignatureVerification("bad".into()).is_transient());
        assert!(!ArchiveError::HashMismatch(IntegrityError::Size {
            path: "x".into(),
            expected: 1,
            actual: 2
        })
        .is_transient());
    }
}
