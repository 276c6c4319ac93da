// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Reading archives with hash chain verification.

Trust flows from a [Keyring] to the suite's `InRelease` signature, from `InRelease`
to the digests it declares for each index, and from index entries to pool files.
[Archive::suite()] establishes the first link. [VerifiedSuite] only hands out
index content whose raw bytes matched the digest declared in `Release`.
*/

use {
    crate::{
        control::{ControlParagraph, ControlParagraphAsyncReader},
        error::{ArchiveError, Result},
        hash::FileHash,
        io::{read_decompressed, Compression, VerificationHandle, VerifyingReader},
        package::Package,
        path_reader::PathReader,
        release::Release,
        signing::Keyring,
        source::Source,
    },
    futures::{io::BufReader, AsyncRead},
    log::{debug, warn},
    std::{collections::BTreeMap, marker::PhantomData, pin::Pin},
};

/// Fetch and verify the `Release` of a suite.
///
/// `InRelease` is preferred. When it does not exist, `Release` is verified against
/// `Release.gpg`.
pub async fn fetch_verified_release<R: PathReader + ?Sized>(
    reader: &R,
    keyring: &Keyring,
    suite: &str,
) -> Result<Release> {
    let inrelease_path = format!("dists/{}/InRelease", suite);

    let text = match reader.get_path_bytes(&inrelease_path).await {
        Ok(data) => {
            let data = String::from_utf8(data).map_err(|_| {
                ArchiveError::CleartextMalformed(format!("{} is not UTF-8", inrelease_path))
            })?;

            keyring.verify_cleartext(&data)?.into_bytes()
        }
        Err(e) if e.is_not_found() => {
            warn!(
                "{} not found; falling back to Release and Release.gpg",
                inrelease_path
            );

            let release = reader
                .get_path_bytes(&format!("dists/{}/Release", suite))
                .await?;
            let signature = reader
                .get_path_bytes(&format!("dists/{}/Release.gpg", suite))
                .await?;
            keyring.verify_detached(&release, &signature)?;

            release
        }
        Err(e) => return Err(e),
    };

    debug!("verified Release of {} from {}", suite, reader.location());

    Release::from_reader(text.as_slice())
}

/// A repository whose suites are trusted through a [Keyring].
pub struct Archive<R: PathReader> {
    reader: R,
    keyring: Keyring,
}

impl<R: PathReader> Archive<R> {
    pub fn new(reader: R, keyring: Keyring) -> Self {
        Self { reader, keyring }
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Obtain a verified suite.
    ///
    /// Fails with [ArchiveError::SignatureVerification] if no trusted key signed it.
    pub async fn suite(&self, name: &str) -> Result<VerifiedSuite<'_, R>> {
        let release = fetch_verified_release(&self.reader, &self.keyring, name).await?;
        let indices = release.indices()?;

        Ok(VerifiedSuite {
            reader: &self.reader,
            name: name.to_string(),
            release,
            indices,
        })
    }
}

type DecodedReader = BufReader<Pin<Box<dyn AsyncRead + Send>>>;

/// Incrementally reads entries of a verified index.
///
/// Entries are yielded before the whole index has been verified. The call that
/// reports end of input also reports a verification failure; when that happens,
/// every entry already received must be discarded.
pub struct IndexReader<T> {
    path: String,
    paragraphs: ControlParagraphAsyncReader<DecodedReader>,
    handle: VerificationHandle,
    done: bool,
    entry: PhantomData<T>,
}

impl<T: From<ControlParagraph>> IndexReader<T> {
    /// Repository path being read.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read the next entry.
    ///
    /// Resolves to [None] once the index is exhausted and verified.
    pub async fn read_entry(&mut self) -> Result<Option<T>> {
        if self.done {
            return Ok(None);
        }

        match self.paragraphs.read_paragraph().await {
            Ok(Some(paragraph)) => Ok(Some(T::from(paragraph))),
            Ok(None) => {
                self.done = true;
                self.handle.finish()?;
                debug!("verified {}", self.path);
                Ok(None)
            }
            Err(e) => {
                self.done = true;
                // A decoder choking on altered content is reported as the alteration.
                Err(self
                    .handle
                    .proven_mismatch()
                    .map(ArchiveError::HashMismatch)
                    .unwrap_or(e))
            }
        }
    }

    /// Read every remaining entry.
    ///
    /// Nothing is returned unless the whole index verified.
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut res = vec![];

        while let Some(entry) = self.read_entry().await? {
            res.push(entry);
        }

        Ok(res)
    }
}

/// A suite whose `Release` passed signature verification.
pub struct VerifiedSuite<'a, R: PathReader> {
    reader: &'a R,
    name: String,
    release: Release,
    indices: BTreeMap<String, FileHash>,
}

impl<'a, R: PathReader> VerifiedSuite<'a, R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn release(&self) -> &Release {
        &self.release
    }

    pub fn has_component(&self, component: &str) -> bool {
        self.release.components().contains(&component)
    }

    pub fn has_arch(&self, arch: &str) -> bool {
        self.release.architectures().contains(&arch)
    }

    /// Pick the variant of an index to fetch.
    ///
    /// The first variant in preferred compression order with a strong digest wins.
    pub fn select_index(&self, path: &str) -> Result<FileHash> {
        Compression::default_preferred_order()
            .find_map(|c| self.indices.get(&format!("{}{}", path, c.extension())))
            .cloned()
            .ok_or_else(|| ArchiveError::UndeclaredIndex(path.to_string()))
    }

    async fn open_index<T: From<ControlParagraph>>(&self, path: &str) -> Result<IndexReader<T>> {
        let expected = self.select_index(path)?;
        let full_path = format!("dists/{}/{}", self.name, expected.filename);
        let compression = Compression::from_path_suffix(&expected.filename);

        debug!("reading {} ({})", full_path, compression);

        let raw = self.reader.get_path(&full_path).await?;
        let (verifying, handle) = VerifyingReader::new(raw, expected);
        let decoded = read_decompressed(Box::pin(BufReader::new(verifying)), compression);

        Ok(IndexReader {
            path: full_path,
            paragraphs: ControlParagraphAsyncReader::new(BufReader::new(decoded)),
            handle,
            done: false,
            entry: PhantomData,
        })
    }

    fn check_component(&self, component: &str) -> Result<()> {
        if self.has_component(component) {
            Ok(())
        } else {
            Err(ArchiveError::UnknownComponent(component.to_string()))
        }
    }

    /// Stream the `Packages` index of a component and architecture.
    pub async fn packages_reader(&self, component: &str, arch: &str) -> Result<IndexReader<Package>> {
        self.check_component(component)?;
        if !self.has_arch(arch) {
            return Err(ArchiveError::UnknownArchitecture(arch.to_string()));
        }

        self.open_index(&format!("{}/binary-{}/Packages", component, arch))
            .await
    }

    /// Stream the `Sources` index of a component.
    pub async fn sources_reader(&self, component: &str) -> Result<IndexReader<Source>> {
        self.check_component(component)?;

        self.open_index(&format!("{}/source/Sources", component))
            .await
    }

    /// All verified `Packages` entries of a component and architecture.
    pub async fn packages(&self, component: &str, arch: &str) -> Result<Vec<Package>> {
        self.packages_reader(component, arch).await?.collect().await
    }

    /// All verified `Sources` entries of a component.
    pub async fn sources(&self, component: &str) -> Result<Vec<Source>> {
        self.sources_reader(component).await?.collect().await
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            control::ControlField,
            error::IntegrityError,
            path_reader::FilesystemPathReader,
            publisher::Publisher,
            release::ReleaseMetadata,
            signing::tests::test_keys,
            store::FilesystemBlobStore,
            suite::{tests::package, Suite, SuiteFeatures},
        },
        std::path::Path,
    };

    fn publish(root: &Path, compressions: Vec<Compression>) -> Result<Keyring> {
        let store = FilesystemBlobStore::new(root)?;
        let (key, keyring) = test_keys();

        let mut suite = Suite::new(
            &store,
            "test",
            ReleaseMetadata::default(),
            SuiteFeatures {
                compressions,
                ..Default::default()
            },
        );
        suite.add_package("main", &package("a", "1.0", "amd64"))?;
        suite.add_package("main", &package("b", "2.0", "amd64"))?;

        let mut source = Source::default();
        source.set("Package", "a");
        source.set("Version", "1.0");
        source.set("Directory", "pool/a/a");
        suite.component("main").add_source(&source)?;

        Publisher::new(&store, Some(key)).publish(suite)?;

        Ok(keyring)
    }

    /// Replace a published file with different content of the same length.
    fn tamper(path: &Path) -> Result<()> {
        let mut data = std::fs::read(path)?;
        let last = data.len() - 2;
        data[last] ^= 0x01;
        std::fs::remove_file(path)?;
        std::fs::write(path, data)?;

        Ok(())
    }

    #[tokio::test]
    async fn read_verified() -> Result<()> {
        let td = tempfile::tempdir()?;
        let keyring = publish(td.path(), vec![Compression::None, Compression::Gzip, Compression::Xz])?;

        let archive = Archive::new(FilesystemPathReader::new(td.path()), keyring);
        let suite = archive.suite("test").await?;

        assert!(suite.has_component("main"));
        assert!(!suite.has_component("contrib"));
        assert!(suite.has_arch("amd64"));
        assert!(!suite.has_arch("arm64"));

        assert_eq!(
            suite.select_index("main/binary-amd64/Packages")?.filename,
            "main/binary-amd64/Packages.xz"
        );

        let packages = suite.packages("main", "amd64").await?;
        assert_eq!(
            packages
                .iter()
                .map(|p| p.package())
                .collect::<Result<Vec<_>>>()?,
            vec!["a", "b"]
        );

        let sources = suite.sources("main").await?;
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].directory()?, "pool/a/a");

        assert!(matches!(
            suite.packages("contrib", "amd64").await,
            Err(ArchiveError::UnknownComponent(_))
        ));
        assert!(matches!(
            suite.packages("main", "arm64").await,
            Err(ArchiveError::UnknownArchitecture(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn tampered_index() -> Result<()> {
        let td = tempfile::tempdir()?;
        let keyring = publish(td.path(), vec![Compression::None])?;
        tamper(&td.path().join("dists/test/main/binary-amd64/Packages"))?;

        let archive = Archive::new(FilesystemPathReader::new(td.path()), keyring);
        let suite = archive.suite("test").await?;

        assert!(matches!(
            suite.packages("main", "amd64").await,
            Err(ArchiveError::HashMismatch(IntegrityError::Digest { .. }))
        ));

        // Streaming hands out entries, then fails at the end.
        let mut reader = suite.packages_reader("main", "amd64").await?;
        let mut seen = 0;
        let res = loop {
            match reader.read_entry().await {
                Ok(Some(_)) => seen += 1,
                res => break res,
            }
        };
        assert!(seen > 0);
        assert!(matches!(res, Err(ArchiveError::HashMismatch(_))));

        Ok(())
    }

    fn source(name: &str, version: &str) -> Source {
        let mut source = Source::default();
        source.set("Package", name);
        source.set("Version", version);
        source.set("Directory", format!("pool/{}/{}", &name[0..1], name));
        source.set_field(ControlField::from_lines(
            "Files",
            vec![
                String::new(),
                format!("d41d8cd98f00b204e9800998ecf8427e 0 {}_{}.dsc", name, version),
                format!("0cc175b9c0f1b6a831c399e269772661 1 {}_{}.tar.xz", name, version),
            ],
        ));
        source
    }

    #[tokio::test]
    async fn components_and_architectures() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = FilesystemBlobStore::new(td.path())?;
        let (key, keyring) = test_keys();

        let mut suite = Suite::new(
            &store,
            "test",
            ReleaseMetadata::default(),
            SuiteFeatures {
                compressions: vec![Compression::Gzip, Compression::Xz],
                ..Default::default()
            },
        );

        let main_amd64 = vec![package("a", "1.0", "amd64"), package("b", "2.0-1", "amd64")];
        let main_arm64 = vec![package("a", "1.0", "arm64")];
        let contrib_amd64 = vec![package("c", "0.1", "amd64")];
        let contrib_arm64 = vec![package("c", "0.1", "arm64"), package("d", "3:1.2", "arm64")];
        let main_sources = vec![source("a", "1.0"), source("b", "2.0-1")];
        let contrib_sources = vec![source("c", "0.1")];

        for (component, packages) in [
            ("main", &main_amd64),
            ("main", &main_arm64),
            ("contrib", &contrib_amd64),
            ("contrib", &contrib_arm64),
        ] {
            for p in packages {
                suite.add_package(component, p)?;
            }
        }
        for (component, sources) in [("main", &main_sources), ("contrib", &contrib_sources)] {
            for s in sources {
                suite.component(component).add_source(s)?;
            }
        }

        Publisher::new(&store, Some(key)).publish(suite)?;

        let archive = Archive::new(FilesystemPathReader::new(td.path()), keyring);
        let suite = archive.suite("test").await?;

        assert_eq!(suite.release().components(), vec!["contrib", "main"]);
        assert_eq!(suite.release().architectures(), vec!["amd64", "arm64"]);

        assert_eq!(suite.packages("main", "amd64").await?, main_amd64);
        assert_eq!(suite.packages("main", "arm64").await?, main_arm64);
        assert_eq!(suite.packages("contrib", "amd64").await?, contrib_amd64);
        assert_eq!(suite.packages("contrib", "arm64").await?, contrib_arm64);
        assert_eq!(suite.sources("main").await?, main_sources);
        assert_eq!(suite.sources("contrib").await?, contrib_sources);

        // Entries carry every field they were published with.
        let read = suite.sources("main").await?;
        let paragraph: &ControlParagraph = &read[0];
        assert_eq!(paragraph, &*main_sources[0]);
        assert_eq!(read[0].files()?.len(), 2);

        Ok(())
    }

    #[tokio::test]
    async fn tampered_sources_index() -> Result<()> {
        for (compression, suffix) in [
            (Compression::None, ""),
            (Compression::Gzip, ".gz"),
            (Compression::Xz, ".xz"),
        ] {
            let td = tempfile::tempdir()?;
            let keyring = publish(td.path(), vec![compression])?;
            tamper(&td.path().join(format!("dists/test/main/source/Sources{}", suffix)))?;

            let archive = Archive::new(FilesystemPathReader::new(td.path()), keyring);
            let suite = archive.suite("test").await?;

            match suite.sources("main").await {
                Err(ArchiveError::HashMismatch(_)) => {}
                res => panic!("{:?} variant accepted: {:?}", compression, res),
            }

            // The untouched Packages index still reads.
            assert_eq!(suite.packages("main", "amd64").await?.len(), 2);
        }

        Ok(())
    }

    #[tokio::test]
    async fn signature_required() -> Result<()> {
        let td = tempfile::tempdir()?;
        publish(td.path(), vec![Compression::None])?;
        let (_, untrusted) = test_keys();

        let archive = Archive::new(FilesystemPathReader::new(td.path()), untrusted);
        assert!(matches!(
            archive.suite("test").await,
            Err(ArchiveError::SignatureVerification(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn detached_fallback() -> Result<()> {
        let td = tempfile::tempdir()?;
        let keyring = publish(td.path(), vec![Compression::None])?;
        std::fs::remove_file(td.path().join("dists/test/InRelease"))?;

        let archive = Archive::new(FilesystemPathReader::new(td.path()), keyring.clone());
        let suite = archive.suite("test").await?;
        assert_eq!(suite.packages("main", "amd64").await?.len(), 2);

        tamper(&td.path().join("dists/test/Release"))?;
        let archive = Archive::new(FilesystemPathReader::new(td.path()), keyring);
        assert!(matches!(
            archive.suite("test").await,
            Err(ArchiveError::SignatureVerification(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn weak_digests_only() -> Result<()> {
        let td = tempfile::tempdir()?;
        std::fs::create_dir_all(td.path().join("dists/test"))?;

        let (key, keyring) = test_keys();
        let release = "Suite: test\nComponents: main\nArchitectures: amd64\n\
                       MD5Sum:\n d41d8cd98f00b204e9800998ecf8427e 0 main/binary-amd64/Packages\n";
        std::fs::write(
            td.path().join("dists/test/InRelease"),
            key.clearsign(release)?,
        )?;

        let archive = Archive::new(FilesystemPathReader::new(td.path()), keyring);
        let suite = archive.suite("test").await?;
        assert!(matches!(
            suite.packages("main", "amd64").await,
            Err(ArchiveError::UndeclaredIndex(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn load_version_maps() -> Result<()> {
        use crate::version_map::{PackageMap, SourceMap};

        let td = tempfile::tempdir()?;
        let store = FilesystemBlobStore::new(td.path())?;
        let (key, keyring) = test_keys();

        let mut suite = Suite::new(&store, "test", ReleaseMetadata::default(), Default::default());
        for version in ["1.0", "2.0"] {
            suite.add_package("main", &package("A", version, "amd64"))?;

            let mut source = Source::default();
            source.set("Package", "A");
            source.set("Version", version);
            source.set("Directory", "pool/A/A");
            suite.component("main").add_source(&source)?;
        }
        Publisher::new(&store, Some(key)).publish(suite)?;

        let archive = Archive::new(FilesystemPathReader::new(td.path()), keyring);
        let suite = archive.suite("test").await?;

        let packages = PackageMap::load(suite.packages_reader("main", "amd64").await?).await?;
        assert_eq!(
            packages
                .get("A")
                .map(|p| p.version_str())
                .collect::<Result<Vec<_>>>()?,
            vec!["2.0", "1.0"]
        );

        let sources = SourceMap::load(suite.sources_reader("main").await?).await?;
        assert_eq!(sources.matches(&"A (>= 1.5)".parse()?)?, 0);

        Ok(())
    }
}
