// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! I/O helpers.

[Compression] maps file name suffixes to codecs. Reading goes through
`async-compression` decoders; publishing goes through the synchronous `libflate`
and `xz2` encoders wrapped by [CompressingWriter].

[VerifyingReader] is a tee that feeds every raw byte it yields into a
[Verifier](crate::hash::Verifier).
*/

use {
    crate::{
        error::{ArchiveError, IntegrityError, Result},
        hash::{FileHash, Verifier},
    },
    async_compression::futures::bufread::{
        BzDecoder, GzipDecoder, LzmaDecoder, XzDecoder, ZstdDecoder,
    },
    futures::{AsyncBufRead, AsyncRead},
    pin_project::pin_project,
    serde::Deserialize,
    std::{
        fmt::{Display, Formatter},
        io::Write,
        pin::Pin,
        str::FromStr,
        sync::{Arc, Mutex, MutexGuard},
        task::{Context, Poll},
    },
    strum::EnumIter,
};

/// Compression format of an archive file.
#[derive(
    Clone, Copy, Debug, Deserialize, EnumIter, Eq, Hash, Ord, PartialEq, PartialOrd,
)]
#[serde(try_from = "String")]
pub enum Compression {
    /// No compression (no extension).
    None,

    /// Gzip compression (.gz extension).
    Gzip,

    /// XZ compression (.xz extension).
    Xz,

    /// Bzip2 compression (.bz2 extension).
    Bzip2,

    /// LZMA compression (.lzma extension).
    Lzma,

    /// Zstandard compression (.zst extension).
    Zstd,
}

impl Compression {
    /// Filename extension for files compressed in this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
            Self::Xz => ".xz",
            Self::Bzip2 => ".bz2",
            Self::Lzma => ".lzma",
            Self::Zstd => ".zst",
        }
    }

    /// Resolve the compression of a path from its suffix.
    ///
    /// Unknown suffixes are treated as uncompressed.
    pub fn from_path_suffix(path: &str) -> Self {
        [
            Self::Gzip,
            Self::Xz,
            Self::Bzip2,
            Self::Lzma,
            Self::Zstd,
        ]
        .into_iter()
        .find(|c| path.ends_with(c.extension()))
        .unwrap_or(Self::None)
    }

    /// Order in which clients prefer to fetch variants of an index.
    pub fn default_preferred_order() -> impl Iterator<Item = Compression> {
        [
            Self::Xz,
            Self::Zstd,
            Self::Gzip,
            Self::Bzip2,
            Self::Lzma,
            Self::None,
        ]
        .into_iter()
    }

    /// Whether indices can be published in this format.
    pub fn is_publishable(&self) -> bool {
        matches!(self, Self::None | Self::Gzip | Self::Xz)
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Bzip2 => "bzip2",
            Self::Lzma => "lzma",
            Self::Zstd => "zstd",
        })
    }
}

impl FromStr for Compression {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "gzip" | "gz" => Ok(Self::Gzip),
            "xz" => Ok(Self::Xz),
            "bzip2" | "bz2" => Ok(Self::Bzip2),
            "lzma" => Ok(Self::Lzma),
            "zstd" | "zst" => Ok(Self::Zstd),
            _ => Err(ArchiveError::UnsupportedCompression(s.to_string())),
        }
    }
}

impl TryFrom<String> for Compression {
    type Error = ArchiveError;

    fn try_from(s: String) -> Result<Self> {
        Self::from_str(&s)
    }
}

/// Wrap a reader with transparent decompression.
pub fn read_decompressed<'a>(
    stream: Pin<Box<dyn AsyncBufRead + Send + 'a>>,
    compression: Compression,
) -> Pin<Box<dyn AsyncRead + Send + 'a>> {
    match compression {
        Compression::None => Box::pin(stream),
        Compression::Gzip => Box::pin(GzipDecoder::new(stream)),
        Compression::Xz => Box::pin(XzDecoder::new(stream)),
        Compression::Bzip2 => Box::pin(BzDecoder::new(stream)),
        Compression::Lzma => Box::pin(LzmaDecoder::new(stream)),
        Compression::Zstd => Box::pin(ZstdDecoder::new(stream)),
    }
}

/// Drain content from a reader to a black hole.
pub async fn drain_reader(reader: impl AsyncRead) -> std::io::Result<u64> {
    let mut sink = futures::io::sink();
    futures::io::copy(reader, &mut sink).await
}

/// A [Write] that compresses into an inner writer.
pub enum CompressingWriter<W: Write> {
    None(W),
    Gzip(libflate::gzip::Encoder<W>),
    Xz(xz2::write::XzEncoder<W>),
}

impl<W: Write> CompressingWriter<W> {
    /// Construct an instance for a publishable [Compression].
    pub fn new(inner: W, compression: Compression) -> Result<Self> {
        match compression {
            Compression::None => Ok(Self::None(inner)),
            Compression::Gzip => Ok(Self::Gzip(libflate::gzip::Encoder::new(inner)?)),
            Compression::Xz => Ok(Self::Xz(xz2::write::XzEncoder::new(inner, 6))),
            c => Err(ArchiveError::UnsupportedCompression(format!(
                "{} cannot be used for publishing",
                c
            ))),
        }
    }

    /// Flush any compressor state and return the inner writer.
    pub fn finish(self) -> std::io::Result<W> {
        match self {
            Self::None(w) => Ok(w),
            Self::Gzip(w) => w.finish().into_result(),
            Self::Xz(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for CompressingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::None(w) => w.write(buf),
            Self::Gzip(w) => w.write(buf),
            Self::Xz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::None(w) => w.flush(),
            Self::Gzip(w) => w.flush(),
            Self::Xz(w) => w.flush(),
        }
    }
}

fn lock_verifier(verifier: &Mutex<Verifier>) -> MutexGuard<'_, Verifier> {
    match verifier.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// An [AsyncRead] adapter that validates content size and digest.
///
/// Validation happens when the source reports end of stream or once more bytes
/// than expected have been read. A mismatch surfaces as an [std::io::Error]
/// carrying an [IntegrityError](crate::error::IntegrityError).
///
/// Consumers that may stop before the source is exhausted (e.g. a decompressor that
/// ends at the end of its frame) must also check the [VerificationHandle].
#[pin_project]
pub struct VerifyingReader<R> {
    #[pin]
    source: R,
    verifier: Arc<Mutex<Verifier>>,
}

impl<R> VerifyingReader<R> {
    /// Create a new instance expecting content matching `expected`.
    pub fn new(source: R, expected: FileHash) -> (Self, VerificationHandle) {
        let verifier = Arc::new(Mutex::new(expected.verifier()));

        (
            Self {
                source,
                verifier: verifier.clone(),
            },
            VerificationHandle { verifier },
        )
    }
}

impl<R> AsyncRead for VerifyingReader<R>
where
    R: AsyncRead,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();

        match this.source.poll_read(cx, buf) {
            Poll::Ready(Ok(size)) => {
                let mut verifier = lock_verifier(this.verifier);

                verifier.update(&buf[0..size]);

                let at_end = size == 0 || verifier.bytes_seen() > verifier.expected().size;

                if at_end {
                    if let Err(e) = verifier.validate() {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            e,
                        )));
                    }
                }

                Poll::Ready(Ok(size))
            }
            res => res,
        }
    }
}

/// Obtains the final verdict of a [VerifyingReader].
#[derive(Clone)]
pub struct VerificationHandle {
    verifier: Arc<Mutex<Verifier>>,
}

impl VerificationHandle {
    /// Validate everything the reader yielded so far.
    ///
    /// Fails unless exactly the expected content passed through the reader.
    pub fn finish(&self) -> Result<()> {
        lock_verifier(&self.verifier)
            .validate()
            .map_err(ArchiveError::HashMismatch)
    }

    /// A mismatch the content seen so far already proves, if any.
    ///
    /// Nothing is concluded before the expected number of bytes arrived.
    pub fn proven_mismatch(&self) -> Option<IntegrityError> {
        let mut verifier = lock_verifier(&self.verifier);

        if verifier.bytes_seen() < verifier.expected().size {
            None
        } else {
            verifier.validate().err()
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::hash::{HashAlgorithm, MultiHashWriter},
        futures::AsyncReadExt,
    };

    fn file_hash(data: &[u8]) -> FileHash {
        let mut writer = MultiHashWriter::new(std::io::sink(), &[HashAlgorithm::Sha256]);
        writer.write_all(data).unwrap();
        writer.finish("Packages").1.remove(0)
    }

    #[test]
    fn suffix_lookup() {
        assert_eq!(Compression::from_path_suffix("Packages.gz"), Compression::Gzip);
        assert_eq!(Compression::from_path_suffix("Packages.xz"), Compression::Xz);
        assert_eq!(Compression::from_path_suffix("Sources.bz2"), Compression::Bzip2);
        assert_eq!(Compression::from_path_suffix("Packages"), Compression::None);
        assert_eq!(Compression::from_path_suffix("Packages.txt"), Compression::None);
        assert!(matches!(
            Compression::from_str("brotli"),
            Err(ArchiveError::UnsupportedCompression(_))
        ));
    }

    #[tokio::test]
    async fn compress_then_decompress() -> Result<()> {
        for compression in [Compression::None, Compression::Gzip, Compression::Xz] {
            let mut writer = CompressingWriter::new(vec![], compression)?;
            writer.write_all(b"Package: a\n")?;
            let data = writer.finish()?;

            let mut reader = read_decompressed(
                Box::pin(futures::io::Cursor::new(data)),
                compression,
            );
            let mut s = String::new();
            reader.read_to_string(&mut s).await?;
            assert_eq!(s, "Package: a\n");
        }

        assert!(CompressingWriter::new(vec![], Compression::Bzip2).is_err());

        Ok(())
    }

    #[tokio::test]
    async fn verifying_reader_accepts_matching_content() -> Result<()> {
        let (mut reader, handle) = VerifyingReader::new(
            futures::io::Cursor::new(b"hello".to_vec()),
            file_hash(b"hello"),
        );

        let mut buf = vec![];
        reader.read_to_end(&mut buf).await?;
        assert_eq!(buf, b"hello");
        handle.finish()?;

        Ok(())
    }

    #[tokio::test]
    async fn verifying_reader_rejects_tampered_content() {
        let (mut reader, handle) = VerifyingReader::new(
            futures::io::Cursor::new(b"hellO".to_vec()),
            file_hash(b"hello"),
        );

        let mut buf = vec![];
        let err = ArchiveError::from(reader.read_to_end(&mut buf).await.unwrap_err());
        assert!(matches!(err, ArchiveError::HashMismatch(_)));
        assert!(matches!(handle.finish(), Err(ArchiveError::HashMismatch(_))));
    }

    #[tokio::test]
    async fn verifying_reader_rejects_extra_content() {
        let (mut reader, _) = VerifyingReader::new(
            futures::io::Cursor::new(b"hello world".to_vec()),
            file_hash(b"hello"),
        );

        let mut buf = vec![];
        assert!(reader.read_to_end(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn handle_fails_closed_on_partial_read() -> Result<()> {
        let (mut reader, handle) = VerifyingReader::new(
            futures::io::Cursor::new(b"hello".to_vec()),
            file_hash(b"hello"),
        );

        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await?;
        assert!(matches!(handle.finish(), Err(ArchiveError::HashMismatch(_))));

        Ok(())
    }
}
