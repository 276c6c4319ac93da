// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The file pool.

Package files live under `pool/<first letter>/<source>/`. Files are copied into the
blob store, hashed on the way in and linked at their canonical path right away.
The returned index entries are ready to be added to a
[Component](crate::suite::Component).
*/

use {
    crate::{
        control::{parse_paragraphs, ControlField},
        deb::DebFile,
        error::{ArchiveError, IntegrityError, Result},
        hash::{FileHash, HashAlgorithm, MultiHashWriter},
        package::Package,
        signing::strip_cleartext_armor,
        source::Source,
        store::{BlobStore, ObjectId},
    },
    log::{debug, info},
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
    },
};

/// Digests recorded for pool files.
const POOL_HASHES: &[HashAlgorithm] = &[
    HashAlgorithm::Md5,
    HashAlgorithm::Sha1,
    HashAlgorithm::Sha256,
];

/// `<first letter>/<source>`.
fn pool_prefix(source: &str) -> Result<String> {
    let first = source
        .chars()
        .next()
        .ok_or_else(|| ArchiveError::Other("empty source package name".into()))?;

    Ok(format!("{}/{}", first, source))
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
        .ok_or_else(|| ArchiveError::Other(format!("invalid file name: {}", path.display())))
}

/// Source files accepted into the pool.
#[derive(Clone, Debug)]
pub struct IncludedSources {
    /// Pool directory, e.g. `pool/h/hello`.
    pub directory: String,
    /// Every linked path and its object, the `.dsc` included.
    pub files: BTreeMap<String, ObjectId>,
    /// Entry for a `Sources` index.
    pub source: Source,
}

pub struct Pool<'a, S: BlobStore> {
    store: &'a S,
}

impl<'a, S: BlobStore> Pool<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Copy a local file into the blob store.
    ///
    /// Hashes carry the file name of `path`. The object comes back pinned; the
    /// caller unpins it once linked.
    pub fn copy(&self, path: impl AsRef<Path>) -> Result<(ObjectId, Vec<FileHash>)> {
        let path = path.as_ref();
        let mut fh = std::fs::File::open(path)
            .map_err(|e| ArchiveError::IoPath(format!("{}", path.display()), e))?;

        let mut writer = MultiHashWriter::new(self.store.create()?, POOL_HASHES);
        std::io::copy(&mut fh, &mut writer)
            .map_err(|e| ArchiveError::IoPath(format!("{}", path.display()), e))?;

        let (inner, hashes) = writer.finish(&file_name(path)?);
        let object = self.store.commit(inner)?;

        debug!("copied {} to object {}", path.display(), object);

        Ok((object, hashes))
    }

    /// Add a `.deb` to the pool, returning its `Packages` entry.
    pub fn include_deb(&self, path: impl AsRef<Path>) -> Result<Package> {
        let deb = DebFile::open(path)?;
        let mut package = Package::from(deb.control);

        let pool_path = format!(
            "pool/{}/{}_{}_{}.deb",
            pool_prefix(package.source_name()?)?,
            package.package()?,
            package.version_str()?,
            package.architecture()?
        );

        let (object, hashes) = self.copy(&deb.path)?;
        let linked = self.store.link(&object, &pool_path);
        self.store.unpin(&object);
        linked?;
        package.set_file(&pool_path, &hashes);

        info!("included {}", pool_path);

        Ok(package)
    }

    /// Add a source package to the pool given its `.dsc`.
    ///
    /// Files named by the `.dsc` are resolved relative to it and must match the
    /// sizes and MD5 digests it declares. Names must be bare file names. The `.dsc` is added to the `Files` and
    /// `Checksums-*` fields of the returned entry.
    pub fn include_sources(&self, dsc_path: impl AsRef<Path>) -> Result<IncludedSources> {
        let dsc_path = dsc_path.as_ref();
        let data = std::fs::read_to_string(dsc_path)
            .map_err(|e| ArchiveError::IoPath(format!("{}", dsc_path.display()), e))?;

        let dsc = parse_paragraphs(&strip_cleartext_armor(&data)?)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ArchiveError::Other(format!("{}: no paragraph", dsc_path.display()))
            })?;

        let name = dsc
            .field_str("Source")
            .ok_or(ArchiveError::ControlRequiredFieldMissing(".dsc", "Source"))?
            .to_string();
        let directory = format!("pool/{}", pool_prefix(&name)?);

        let mut source = Source::from_dsc(dsc, &directory)?;

        let mut pinned = vec![];
        let res = self.link_sources(dsc_path, &directory, &mut source, &mut pinned);
        for object in &pinned {
            self.store.unpin(object);
        }
        let files = res?;

        info!("included {} source files in {}", files.len(), directory);

        Ok(IncludedSources {
            directory,
            files,
            source,
        })
    }

    fn link_sources(
        &self,
        dsc_path: &Path,
        directory: &str,
        source: &mut Source,
        pinned: &mut Vec<ObjectId>,
    ) -> Result<BTreeMap<String, ObjectId>> {
        let declared_files = source.files()?;
        for declared in &declared_files {
            declared_file_name(&declared.filename)?;
        }

        let base = dsc_path.parent().map(PathBuf::from).unwrap_or_default();
        let mut files = BTreeMap::new();

        for declared in declared_files {
            let (object, hashes) = self.copy(base.join(&declared.filename))?;
            pinned.push(object.clone());
            check_declared(&declared, &hashes)?;

            files.insert(format!("{}/{}", directory, declared.filename), object);
        }

        let (object, dsc_hashes) = self.copy(dsc_path)?;
        pinned.push(object.clone());
        files.insert(format!("{}/{}", directory, file_name(dsc_path)?), object);

        for (path, object) in &files {
            self.store.link(object, path)?;
        }

        add_checksum_lines(source, &dsc_hashes);

        Ok(files)
    }
}

fn declared_file_name(name: &str) -> Result<&str> {
    match Path::new(name).file_name().and_then(|n| n.to_str()) {
        Some(base) if base == name => Ok(name),
        _ => Err(ArchiveError::Other(format!(
            "invalid file name in .dsc: {}",
            name
        ))),
    }
}

fn check_declared(declared: &FileHash, actual: &[FileHash]) -> Result<()> {
    let actual = actual
        .iter()
        .find(|h| h.algorithm == declared.algorithm)
        .ok_or_else(|| ArchiveError::Other(format!("no {} digest", declared.algorithm.name())))?;

    if actual.size != declared.size {
        return Err(IntegrityError::Size {
            path: declared.filename.clone(),
            expected: declared.size,
            actual: actual.size,
        }
        .into());
    }

    if actual.digest != declared.digest {
        return Err(IntegrityError::Digest {
            path: declared.filename.clone(),
            algorithm: declared.algorithm,
            expected: declared.digest_hex(),
            actual: actual.digest_hex(),
        }
        .into());
    }

    Ok(())
}

/// Append a file's lines to the checksum fields a source entry carries.
fn add_checksum_lines(source: &mut Source, hashes: &[FileHash]) {
    for hash in hashes {
        let field = match hash.algorithm {
            HashAlgorithm::Md5 => "Files",
            HashAlgorithm::Sha1 => "Checksums-Sha1",
            HashAlgorithm::Sha256 => "Checksums-Sha256",
            HashAlgorithm::Sha512 => "Checksums-Sha512",
        };

        let mut lines = vec![String::new()];
        if let Some(existing) = source.iter_field_lines(field) {
            lines.extend(existing.map(|l| l.to_string()));
        } else if hash.algorithm != HashAlgorithm::Md5 {
            continue;
        }

        lines.push(format!("{} {} {}", hash.digest_hex(), hash.size, hash.filename));
        source.set_field(ControlField::from_lines(field, lines));
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{deb::tests::build_deb, store::FilesystemBlobStore},
        std::io::Read,
    };

    fn read(store: &FilesystemBlobStore, path: &str) -> Vec<u8> {
        let mut buf = vec![];
        store.open_path(path).unwrap().read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn prefix() -> Result<()> {
        assert_eq!(pool_prefix("hello")?, "h/hello");
        assert_eq!(pool_prefix("libzstd")?, "l/libzstd");
        assert!(pool_prefix("").is_err());

        Ok(())
    }

    #[test]
    fn include_deb() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = FilesystemBlobStore::new(td.path().join("repo"))?;
        let pool = Pool::new(&store);

        let deb_path = td.path().join("zstd.deb");
        let deb = build_deb(
            "Package: zstd\nSource: libzstd (1.4.8+dfsg-2.1)\nVersion: 1.4.8+dfsg-2.1\n\
             Architecture: amd64\nMaintainer: Someone <someone@example.com>\n\
             Description: compression\n",
        );
        std::fs::write(&deb_path, &deb)?;

        let package = pool.include_deb(&deb_path)?;
        package.validate()?;

        let path = "pool/l/libzstd/zstd_1.4.8+dfsg-2.1_amd64.deb";
        assert_eq!(package.filename()?, path);
        assert_eq!(package.size()?, deb.len() as u64);
        assert!(package.has_field("SHA256"));
        assert!(package.has_field("MD5sum"));
        assert_eq!(read(&store, path), deb);

        let sha256 = package.digest(HashAlgorithm::Sha256).unwrap()?;
        assert_eq!(sha256.filename, path);

        Ok(())
    }

    #[test]
    fn include_sources() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = FilesystemBlobStore::new(td.path().join("repo"))?;
        let pool = Pool::new(&store);

        let orig = b"upstream tarball";
        let md5 = {
            let mut d = HashAlgorithm::Md5.new_digester();
            d.update(orig);
            hex::encode(d.finalize())
        };
        std::fs::write(td.path().join("hello_1.0.orig.tar.gz"), orig)?;

        let dsc = format!(
            "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA512\n\n\
             Format: 3.0 (quilt)\nSource: hello\nVersion: 1.0-1\n\
             Files:\n {} {} hello_1.0.orig.tar.gz\n\
             -----BEGIN PGP SIGNATURE-----\n\nAAAA\n-----END PGP SIGNATURE-----\n",
            md5,
            orig.len()
        );
        let dsc_path = td.path().join("hello_1.0-1.dsc");
        std::fs::write(&dsc_path, &dsc)?;

        let included = pool.include_sources(&dsc_path)?;
        assert_eq!(included.directory, "pool/h/hello");
        assert_eq!(
            included.files.keys().collect::<Vec<_>>(),
            vec![
                "pool/h/hello/hello_1.0-1.dsc",
                "pool/h/hello/hello_1.0.orig.tar.gz"
            ]
        );
        assert_eq!(read(&store, "pool/h/hello/hello_1.0.orig.tar.gz"), orig);
        assert_eq!(read(&store, "pool/h/hello/hello_1.0-1.dsc"), dsc.as_bytes());

        let source = included.source;
        source.validate()?;
        assert_eq!(source.package()?, "hello");
        let files = source.files()?;
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].filename, "hello_1.0-1.dsc");
        assert_eq!(files[1].size, dsc.len() as u64);
        assert!(!source.has_field("Checksums-Sha256"));

        // Linked objects are released to collection.
        let report = store.gc()?;
        assert_eq!(report.objects_kept, 2);
        assert_eq!(report.objects_removed, 0);

        Ok(())
    }

    #[test]
    fn include_sources_rejects_mismatch() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = FilesystemBlobStore::new(td.path().join("repo"))?;
        let pool = Pool::new(&store);

        std::fs::write(td.path().join("hello_1.0.orig.tar.gz"), b"tampered")?;
        let dsc_path = td.path().join("hello_1.0-1.dsc");
        std::fs::write(
            &dsc_path,
            "Source: hello\nVersion: 1.0-1\nFiles:\n \
             6cd0ffea3884a4e79330338dcc2987d6 8 hello_1.0.orig.tar.gz\n",
        )?;

        assert!(matches!(
            pool.include_sources(&dsc_path),
            Err(ArchiveError::HashMismatch(IntegrityError::Digest { .. }))
        ));
        assert!(store.open_path("pool/h/hello/hello_1.0-1.dsc").is_err());

        // The rejected copy is not left pinned.
        assert_eq!(store.gc()?.objects_removed, 1);

        Ok(())
    }

    #[test]
    fn include_sources_rejects_paths() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = FilesystemBlobStore::new(td.path().join("repo"))?;
        let pool = Pool::new(&store);

        std::fs::write(td.path().join("secret"), b"secret")?;
        std::fs::create_dir_all(td.path().join("upload"))?;
        let dsc_path = td.path().join("upload/hello_1.0-1.dsc");

        for name in ["../secret", "sub/secret", "/etc/passwd", ".."] {
            std::fs::write(
                &dsc_path,
                format!(
                    "Source: hello
Version: 1.0-1
Files:
                      0f3bd9fd9d1a4d25d5e4c6a4a6b0b1f2 6 {}
",
                    name
                ),
            )?;

            match pool.include_sources(&dsc_path) {
                Err(ArchiveError::Other(msg)) => assert!(msg.contains(name), "{}", msg),
                res => panic!("{} accepted: {:?}", name, res.map(|i| i.files)),
            }
        }

        // Nothing was copied.
        let report = store.gc()?;
        assert_eq!(report.objects_kept + report.objects_removed, 0);

        Ok(())
    }
}
