// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Content addressed blob storage.

Published archives are built on a two level store. Content is first written to an
anonymous temporary blob and committed, which names it by its SHA-256 digest. A
committed object is invisible until it is linked at a repository path. Linking
replaces whatever that path pointed at in a single atomic step.

Committed objects start out *pinned*. Garbage collection keeps pinned objects
even when no path refers to them, so content committed for a publish that hasn't
been linked yet survives a concurrent collection. Whoever committed an object
releases the pin with [BlobStore::unpin()] once the object is linked or
abandoned.

[FilesystemBlobStore] keeps objects at `<root>/.blobs/objects/<sha256>` and
materializes links as relative symlinks under `<root>`. Where symlinks are
unavailable, links are hard links and collection identifies them by content.
*/

use {
    crate::{
        error::{ArchiveError, Result},
        hash::{Digester, HashAlgorithm},
    },
    log::{debug, info},
    std::{
        collections::{HashMap, HashSet},
        fmt::{Display, Formatter},
        io::{BufWriter, Read, Write},
        path::{Component, Path, PathBuf},
        sync::{Mutex, MutexGuard},
    },
    tempfile::NamedTempFile,
};

/// Name of the directory under the store root holding store state.
pub const BLOBS_DIR: &str = ".blobs";

/// Identifies a committed object: the hex SHA-256 of its content.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a garbage collection pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GcReport {
    pub objects_kept: usize,
    pub objects_removed: usize,
    pub bytes_removed: u64,
}

/// A content addressed store with atomically swappable path links.
pub trait BlobStore {
    /// Handle receiving the content of a new blob.
    type Writer: Write;

    /// Begin writing a new blob.
    fn create(&self) -> Result<Self::Writer>;

    /// Finish a blob, turning it into an immutable object.
    ///
    /// Committing content identical to an existing object yields that object.
    /// Either way the object gains a pin, released by [Self::unpin()].
    fn commit(&self, writer: Self::Writer) -> Result<ObjectId>;

    /// Release a pin taken by [Self::commit()].
    fn unpin(&self, object: &ObjectId);

    /// Whether a committed object is present.
    fn contains(&self, object: &ObjectId) -> bool;

    /// Atomically point a repository relative `path` at `object`.
    fn link(&self, object: &ObjectId, path: &str) -> Result<()>;

    /// Open the content currently linked at `path`.
    fn open_path(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    /// Remove every object neither linked from any path nor pinned.
    fn gc(&self) -> Result<GcReport>;
}

/// Receives the content of a new [FilesystemBlobStore] blob.
pub struct FilesystemBlobWriter {
    file: BufWriter<NamedTempFile>,
    digester: Digester,
}

impl Write for FilesystemBlobWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let count = self.file.write(buf)?;
        self.digester.update(&buf[0..count]);

        Ok(count)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// A [BlobStore] backed by a local directory.
pub struct FilesystemBlobStore {
    root: PathBuf,
    /// Serializes commit, link and gc.
    lock: Mutex<()>,
    /// Pin counts of committed objects.
    pins: Mutex<HashMap<ObjectId, usize>>,
}

impl FilesystemBlobStore {
    /// Open a store rooted at `root`, creating its state directories.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        for dir in [root.join(BLOBS_DIR).join("objects"), root.join(BLOBS_DIR).join("tmp")] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| ArchiveError::IoPath(format!("{}", dir.display()), e))?;
        }

        Ok(Self {
            root,
            lock: Mutex::new(()),
            pins: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join(BLOBS_DIR).join("objects")
    }

    /// Filesystem path of an object.
    pub fn object_path(&self, object: &ObjectId) -> PathBuf {
        self.objects_dir().join(object.as_str())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn pins(&self) -> MutexGuard<'_, HashMap<ObjectId, usize>> {
        match self.pins.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of pins held on an object.
    pub fn pin_count(&self, object: &ObjectId) -> usize {
        self.pins().get(object).copied().unwrap_or(0)
    }

    /// Resolve and validate a repository relative path.
    fn repository_path(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);

        let valid = !path.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            && rel
                .components()
                .next()
                .map(|c| c.as_os_str() != BLOBS_DIR)
                .unwrap_or(false);

        if !valid {
            return Err(ArchiveError::Other(format!(
                "invalid repository path: {}",
                path
            )));
        }

        Ok(self.root.join(rel))
    }

    /// The object a path is linked to, if any.
    pub fn object_for_path(&self, path: &str) -> Result<Option<ObjectId>> {
        let full = self.repository_path(path)?;

        match std::fs::read_link(&full) {
            Ok(target) => Ok(target
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| ObjectId(name.to_string()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ArchiveError::IoPath(format!("{}", full.display()), e)),
        }
    }
}

/// Symlink target of `path` pointing at `object` relative to the store root.
fn relative_object_target(path: &str, object: &ObjectId) -> PathBuf {
    let depth = Path::new(path).components().count().saturating_sub(1);

    let mut target = PathBuf::new();
    for _ in 0..depth {
        target.push("..");
    }

    target.join(BLOBS_DIR).join("objects").join(object.as_str())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut fh = std::fs::File::open(path)
        .map_err(|e| ArchiveError::IoPath(format!("{}", path.display()), e))?;

    let mut digester = HashAlgorithm::Sha256.new_digester();
    let mut buf = [0u8; 32768];
    loop {
        let count = fh
            .read(&mut buf)
            .map_err(|e| ArchiveError::IoPath(format!("{}", path.display()), e))?;
        if count == 0 {
            break;
        }
        digester.update(&buf[0..count]);
    }

    Ok(hex::encode(digester.finalize()))
}

#[cfg(unix)]
fn make_link(target: &Path, _object_path: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_link(_target: &Path, object_path: &Path, link: &Path) -> std::io::Result<()> {
    std::fs::hard_link(object_path, link)
}

impl BlobStore for FilesystemBlobStore {
    type Writer = FilesystemBlobWriter;

    fn create(&self) -> Result<Self::Writer> {
        let tmp = self.root.join(BLOBS_DIR).join("tmp");
        let file = NamedTempFile::new_in(&tmp)
            .map_err(|e| ArchiveError::IoPath(format!("{}", tmp.display()), e))?;

        Ok(FilesystemBlobWriter {
            file: BufWriter::new(file),
            digester: HashAlgorithm::Sha256.new_digester(),
        })
    }

    fn commit(&self, writer: Self::Writer) -> Result<ObjectId> {
        let file = writer
            .file
            .into_inner()
            .map_err(|e| ArchiveError::Io(e.into_error()))?;
        file.as_file().sync_all()?;

        let object = ObjectId(hex::encode(writer.digester.finalize()));
        let dest = self.object_path(&object);

        // gc must not run between the object appearing and its pin.
        let _guard = self.lock();

        if dest.exists() {
            debug!("object {} already present", object);
        } else {
            file.persist(&dest)
                .map_err(|e| ArchiveError::IoPath(format!("{}", dest.display()), e.error))?;
            debug!("committed object {}", object);
        }

        *self.pins().entry(object.clone()).or_insert(0) += 1;

        Ok(object)
    }

    fn unpin(&self, object: &ObjectId) {
        let mut pins = self.pins();

        if let Some(count) = pins.get_mut(object) {
            *count -= 1;
            if *count == 0 {
                pins.remove(object);
            }
        }
    }

    fn contains(&self, object: &ObjectId) -> bool {
        self.object_path(object).is_file()
    }

    fn link(&self, object: &ObjectId, path: &str) -> Result<()> {
        let full = self.repository_path(path)?;
        let object_path = self.object_path(object);

        let _guard = self.lock();

        if !object_path.exists() {
            return Err(ArchiveError::NotFound(format!("object {}", object)));
        }

        let parent = full
            .parent()
            .ok_or_else(|| ArchiveError::Other(format!("path has no parent: {}", path)))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| ArchiveError::IoPath(format!("{}", parent.display()), e))?;

        let file_name = full
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ArchiveError::Other(format!("invalid file name: {}", path)))?;
        let staging = parent.join(format!(".{}.link-{:016x}", file_name, rand::random::<u64>()));

        make_link(&relative_object_target(path, object), &object_path, &staging)
            .map_err(|e| ArchiveError::IoPath(format!("{}", staging.display()), e))?;

        if let Err(e) = std::fs::rename(&staging, &full) {
            let _ = std::fs::remove_file(&staging);
            return Err(ArchiveError::IoPath(format!("{}", full.display()), e));
        }

        debug!("linked {} -> {}", path, object);

        Ok(())
    }

    fn open_path(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let full = self.repository_path(path)?;

        match std::fs::File::open(&full) {
            Ok(fh) => Ok(Box::new(fh)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArchiveError::NotFound(path.to_string()))
            }
            Err(e) => Err(ArchiveError::IoPath(format!("{}", full.display()), e)),
        }
    }

    fn gc(&self) -> Result<GcReport> {
        let _guard = self.lock();

        let objects_dir = self.objects_dir();
        let mut referenced = self
            .pins()
            .keys()
            .map(|object| object.as_str().to_string())
            .collect::<HashSet<_>>();

        let walker = walkdir::WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() != 1 || entry.file_name() != BLOBS_DIR);

        for entry in walker {
            let entry = entry.map_err(|e| ArchiveError::Other(format!("{}", e)))?;

            if entry.path_is_symlink() {
                let target = std::fs::read_link(entry.path())
                    .map_err(|e| ArchiveError::IoPath(format!("{}", entry.path().display()), e))?;

                if let Some(name) = target.file_name().and_then(|n| n.to_str()) {
                    referenced.insert(name.to_string());
                }
            } else if entry.file_type().is_file() {
                // A hard link shares its object's content, and so its name.
                let name = sha256_file(entry.path())?;
                if objects_dir.join(&name).is_file() {
                    referenced.insert(name);
                }
            }
        }

        let mut report = GcReport::default();

        for entry in std::fs::read_dir(&objects_dir)
            .map_err(|e| ArchiveError::IoPath(format!("{}", objects_dir.display()), e))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();

            if referenced.contains(&name) {
                report.objects_kept += 1;
                continue;
            }

            let size = entry.metadata()?.len();
            std::fs::remove_file(entry.path())
                .map_err(|e| ArchiveError::IoPath(format!("{}", entry.path().display()), e))?;
            debug!("removed unreferenced object {}", name);

            report.objects_removed += 1;
            report.bytes_removed += size;
        }

        info!(
            "garbage collection kept {} objects; removed {} ({} bytes)",
            report.objects_kept, report.objects_removed, report.bytes_removed
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Commit content and drop the commit's pin.
    fn put(store: &FilesystemBlobStore, data: &[u8]) -> Result<ObjectId> {
        let mut writer = store.create()?;
        writer.write_all(data)?;
        let object = store.commit(writer)?;
        store.unpin(&object);

        Ok(object)
    }

    fn read(store: &FilesystemBlobStore, path: &str) -> Result<Vec<u8>> {
        let mut buf = vec![];
        store.open_path(path)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    #[test]
    fn commit_is_content_addressed() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = FilesystemBlobStore::new(td.path())?;

        let a = put(&store, b"hello")?;
        let b = put(&store, b"hello")?;
        assert_eq!(a, b);
        assert_eq!(
            a.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(store.object_path(&a).exists());

        // Uncommitted writers leave nothing behind.
        let mut writer = store.create()?;
        writer.write_all(b"abandoned")?;
        drop(writer);
        assert_eq!(std::fs::read_dir(td.path().join(".blobs/tmp"))?.count(), 0);

        Ok(())
    }

    #[test]
    fn link_replaces_atomically() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = FilesystemBlobStore::new(td.path())?;

        let v1 = put(&store, b"v1")?;
        let v2 = put(&store, b"v2")?;

        store.link(&v1, "dists/test/Release")?;
        assert_eq!(read(&store, "dists/test/Release")?, b"v1");
        assert_eq!(store.object_for_path("dists/test/Release")?, Some(v1));

        store.link(&v2, "dists/test/Release")?;
        assert_eq!(read(&store, "dists/test/Release")?, b"v2");
        assert_eq!(store.object_for_path("dists/test/Release")?, Some(v2));

        // No staging links survive.
        assert_eq!(std::fs::read_dir(td.path().join("dists/test"))?.count(), 1);

        assert!(matches!(
            store.open_path("dists/test/InRelease"),
            Err(ArchiveError::NotFound(_))
        ));
        assert!(store.object_for_path("dists/test/InRelease")?.is_none());

        Ok(())
    }

    #[test]
    fn link_rejects_bad_input() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = FilesystemBlobStore::new(td.path())?;
        let object = put(&store, b"x")?;

        assert!(store.link(&object, "../escape").is_err());
        assert!(store.link(&object, "/abs").is_err());
        assert!(store.link(&object, ".blobs/objects/x").is_err());
        assert!(matches!(
            store.link(&ObjectId("00".repeat(32)), "dists/x"),
            Err(ArchiveError::NotFound(_))
        ));

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn gc_removes_unlinked() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = FilesystemBlobStore::new(td.path())?;

        let kept = put(&store, b"kept")?;
        let replaced = put(&store, b"replaced")?;
        let orphan = put(&store, b"orphan")?;

        store.link(&replaced, "pool/a/file")?;
        store.link(&kept, "pool/a/file")?;

        let report = store.gc()?;
        assert_eq!(report.objects_kept, 1);
        assert_eq!(report.objects_removed, 2);
        assert_eq!(report.bytes_removed, 14);

        assert!(store.object_path(&kept).exists());
        assert!(!store.object_path(&replaced).exists());
        assert!(!store.object_path(&orphan).exists());
        assert_eq!(read(&store, "pool/a/file")?, b"kept");

        Ok(())
    }

    #[test]
    fn gc_spares_pinned() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = FilesystemBlobStore::new(td.path())?;

        let mut writer = store.create()?;
        writer.write_all(b"pending")?;
        let pending = store.commit(writer)?;

        // Committing the same content again takes a second pin.
        let mut writer = store.create()?;
        writer.write_all(b"pending")?;
        assert_eq!(store.commit(writer)?, pending);
        assert_eq!(store.pin_count(&pending), 2);

        assert_eq!(store.gc()?.objects_removed, 0);
        assert!(store.contains(&pending));

        store.unpin(&pending);
        assert_eq!(store.gc()?.objects_removed, 0);

        store.unpin(&pending);
        assert_eq!(store.pin_count(&pending), 0);
        assert_eq!(store.gc()?.objects_removed, 1);
        assert!(!store.contains(&pending));

        // Unpinning an unknown object is harmless.
        store.unpin(&pending);

        Ok(())
    }

    #[test]
    fn gc_counts_hard_links() -> Result<()> {
        let td = tempfile::tempdir()?;
        let store = FilesystemBlobStore::new(td.path())?;

        let linked = put(&store, b"hard linked")?;
        let orphan = put(&store, b"orphan")?;

        std::fs::create_dir_all(td.path().join("pool/a"))?;
        std::fs::hard_link(store.object_path(&linked), td.path().join("pool/a/file"))?;

        let report = store.gc()?;
        assert_eq!(report.objects_kept, 1);
        assert_eq!(report.objects_removed, 1);
        assert!(store.contains(&linked));
        assert!(!store.contains(&orphan));

        Ok(())
    }
}
