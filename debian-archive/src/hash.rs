// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Content digests.

[HashAlgorithm] is the closed set of digest algorithms archives use. A
[MultiHashWriter] feeds every written byte into one [Digester] per algorithm and
yields a [FileHash] for each once the document is complete. A [Verifier] does the
inverse: it is seeded with an expected [FileHash] and reports whether streamed
content matched it.
*/

use {
    crate::error::{ArchiveError, IntegrityError, Result},
    digest::Digest,
    serde::Deserialize,
    std::{
        fmt::{Display, Formatter},
        io::Write,
        str::FromStr,
    },
    strum::EnumIter,
};

/// A digest algorithm used to describe archive content.
#[derive(Clone, Copy, Debug, Deserialize, EnumIter, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[serde(try_from = "String")]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Lowercase name of the algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Name of the `Release` field listing digests of this flavor.
    ///
    /// This is also the directory name used by `by-hash` paths.
    pub fn release_field_name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5Sum",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    /// Name of the field in `Packages` paragraphs holding the digest of a `.deb`.
    pub fn package_field_name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5sum",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    /// Resolve an instance from a `Release` field name.
    pub fn from_release_field_name(name: &str) -> Option<Self> {
        match name {
            "MD5Sum" => Some(Self::Md5),
            "SHA1" => Some(Self::Sha1),
            "SHA256" => Some(Self::Sha256),
            "SHA512" => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Whether clients may trust this algorithm on its own.
    pub fn is_strong(&self) -> bool {
        matches!(self, Self::Sha256 | Self::Sha512)
    }

    /// Length in bytes of digests produced by this algorithm.
    pub fn digest_len(&self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    /// Algorithms from most to least preferred.
    pub fn preferred_order() -> impl Iterator<Item = HashAlgorithm> {
        [Self::Sha512, Self::Sha256, Self::Sha1, Self::Md5].into_iter()
    }

    /// Obtain a fresh digester for this algorithm.
    pub fn new_digester(&self) -> Digester {
        match self {
            Self::Md5 => Digester::Md5(md5::Md5::new()),
            Self::Sha1 => Digester::Sha1(sha1::Sha1::new()),
            Self::Sha256 => Digester::Sha256(sha2::Sha256::new()),
            Self::Sha512 => Digester::Sha512(sha2::Sha512::new()),
        }
    }
}

impl Display for HashAlgorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" | "md5sum" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => Err(ArchiveError::UnsupportedHashAlgorithm(s.to_string())),
        }
    }
}

impl TryFrom<String> for HashAlgorithm {
    type Error = ArchiveError;

    fn try_from(s: String) -> Result<Self> {
        Self::from_str(&s)
    }
}

/// An in-progress digest computation.
#[derive(Clone)]
pub enum Digester {
    Md5(md5::Md5),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

impl Digester {
    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Self::Md5(_) => HashAlgorithm::Md5,
            Self::Sha1(_) => HashAlgorithm::Sha1,
            Self::Sha256(_) => HashAlgorithm::Sha256,
            Self::Sha512(_) => HashAlgorithm::Sha512,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(d) => d.update(data),
            Self::Sha1(d) => d.update(data),
            Self::Sha256(d) => d.update(data),
            Self::Sha512(d) => d.update(data),
        }
    }

    /// Consume the instance and obtain the final digest.
    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Md5(d) => d.finalize().to_vec(),
            Self::Sha1(d) => d.finalize().to_vec(),
            Self::Sha256(d) => d.finalize().to_vec(),
            Self::Sha512(d) => d.finalize().to_vec(),
        }
    }
}

impl pgp::crypto::Hasher for Digester {
    fn update(&mut self, data: &[u8]) {
        Digester::update(self, data)
    }

    fn finish(self: Box<Self>) -> Vec<u8> {
        self.finalize()
    }
}

impl Write for Digester {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// The digest of a file under one algorithm.
///
/// `filename` is relative to whatever document lists the entry: the suite
/// directory for `Release` entries, the archive root for pool files.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FileHash {
    pub algorithm: HashAlgorithm,
    pub digest: Vec<u8>,
    pub size: u64,
    pub filename: String,
}

impl FileHash {
    /// Construct an instance from a hex encoded digest.
    pub fn from_hex(
        algorithm: HashAlgorithm,
        digest: &str,
        size: u64,
        filename: impl ToString,
    ) -> Result<Self> {
        let digest = hex::decode(digest)?;

        if digest.len() != algorithm.digest_len() {
            return Err(ArchiveError::Other(format!(
                "{} digest has {} bytes; expected {}",
                algorithm,
                digest.len(),
                algorithm.digest_len()
            )));
        }

        Ok(Self {
            algorithm,
            digest,
            size,
            filename: filename.to_string(),
        })
    }

    /// Parse a `<digest> <size> <path>` line as found in `Release` and `.dsc` files.
    pub fn from_checksum_line(algorithm: HashAlgorithm, line: &str) -> Result<Self> {
        let mut parts = line.split_ascii_whitespace();

        let digest = parts.next().ok_or(ArchiveError::ReleaseMissingDigest)?;
        let size = parts.next().ok_or(ArchiveError::ReleaseMissingSize)?;
        let path = parts.next().ok_or(ArchiveError::ReleaseMissingPath)?;

        if parts.next().is_some() {
            return Err(ArchiveError::ReleasePathWithSpaces(line.to_string()));
        }

        Self::from_hex(algorithm, digest, u64::from_str(size)?, path)
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(&self.digest)
    }

    /// The `by-hash` path variant of this entry.
    ///
    /// The alias lives beside the file: `<dir>/by-hash/<FIELD>/<hexdigest>`.
    pub fn by_hash_path(&self) -> String {
        let field = self.algorithm.release_field_name();

        match self.filename.rsplit_once('/') {
            Some((dir, _)) => format!("{}/by-hash/{}/{}", dir, field, self.digest_hex()),
            None => format!("by-hash/{}/{}", field, self.digest_hex()),
        }
    }

    /// Obtain a copy of this instance describing a different path.
    pub fn with_filename(&self, filename: impl ToString) -> Self {
        Self {
            filename: filename.to_string(),
            ..self.clone()
        }
    }

    /// Obtain a [Verifier] expecting content matching this instance.
    pub fn verifier(&self) -> Verifier {
        Verifier::new(self.clone())
    }
}

/// A [Write] adapter that digests everything written through it.
///
/// Every write is forwarded to the inner writer and, for the bytes the inner
/// writer accepted, to one [Digester] per configured algorithm.
pub struct MultiHashWriter<W> {
    inner: W,
    digesters: Vec<Digester>,
    size: u64,
}

impl<W: Write> MultiHashWriter<W> {
    pub fn new(inner: W, algorithms: &[HashAlgorithm]) -> Self {
        let mut algorithms = algorithms.to_vec();
        algorithms.sort();
        algorithms.dedup();

        Self {
            inner,
            digesters: algorithms.iter().map(|a| a.new_digester()).collect(),
            size: 0,
        }
    }

    /// Number of bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.size
    }

    /// Finish hashing.
    ///
    /// Returns the inner writer and one [FileHash] per algorithm, each naming
    /// `filename`.
    pub fn finish(self, filename: &str) -> (W, Vec<FileHash>) {
        let size = self.size;

        let hashes = self
            .digesters
            .into_iter()
            .map(|d| FileHash {
                algorithm: d.algorithm(),
                digest: d.finalize(),
                size,
                filename: filename.to_string(),
            })
            .collect();

        (self.inner, hashes)
    }
}

impl<W: Write> Write for MultiHashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let count = self.inner.write(buf)?;

        for digester in self.digesters.iter_mut() {
            digester.update(&buf[0..count]);
        }
        self.size += count as u64;

        Ok(count)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Checks streamed content against an expected [FileHash].
pub struct Verifier {
    expected: FileHash,
    digester: Option<Digester>,
    size: u64,
    outcome: Option<std::result::Result<(), IntegrityError>>,
}

impl Verifier {
    pub fn new(expected: FileHash) -> Self {
        Self {
            digester: Some(expected.algorithm.new_digester()),
            expected,
            size: 0,
            outcome: None,
        }
    }

    pub fn expected(&self) -> &FileHash {
        &self.expected
    }

    /// Number of bytes fed into this instance.
    pub fn bytes_seen(&self) -> u64 {
        self.size
    }

    /// Feed content into the verifier.
    ///
    /// Content arriving after [Self::validate()] was called is counted but not hashed,
    /// so a later validation reports the size mismatch.
    pub fn update(&mut self, data: &[u8]) {
        self.size += data.len() as u64;

        if let Some(digester) = self.digester.as_mut() {
            digester.update(data);
        }

        if self.outcome.is_some() && !data.is_empty() {
            self.outcome = None;
        }
    }

    /// Compare everything seen so far against the expectation.
    ///
    /// Calling this more than once returns the same answer as long as no more
    /// content arrives.
    pub fn validate(&mut self) -> std::result::Result<(), IntegrityError> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        let outcome = if self.size != self.expected.size {
            self.digester = None;

            Err(IntegrityError::Size {
                path: self.expected.filename.clone(),
                expected: self.expected.size,
                actual: self.size,
            })
        } else if let Some(digester) = self.digester.take() {
            let actual = digester.finalize();

            if actual == self.expected.digest {
                Ok(())
            } else {
                Err(IntegrityError::Digest {
                    path: self.expected.filename.clone(),
                    algorithm: self.expected.algorithm,
                    expected: self.expected.digest_hex(),
                    actual: hex::encode(actual),
                })
            }
        } else {
            // Content arrived after an earlier validation consumed the digester.
            Err(IntegrityError::Size {
                path: self.expected.filename.clone(),
                expected: self.expected.size,
                actual: self.size,
            })
        };

        self.outcome = Some(outcome.clone());

        outcome
    }
}
