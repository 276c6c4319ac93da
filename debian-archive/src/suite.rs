// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Accumulating a suite for publishing.

A [Suite] owns [Component]s, which route packages to one [PackageWriter] per
architecture and sources to a [SourceWriter]. Writers stream each paragraph
straight into blob store handles, one per configured compression, hashing the
stored bytes as they go. Nothing is buffered beyond encoder state.

Nothing becomes visible until [crate::publisher::Publisher] engrosses and links
the suite.
*/

use {
    crate::{
        control::{ControlParagraph, ControlParagraphWriter},
        error::Result,
        hash::{FileHash, HashAlgorithm, MultiHashWriter},
        io::{CompressingWriter, Compression},
        package::Package,
        release::ReleaseMetadata,
        source::Source,
        store::{BlobStore, ObjectId},
    },
    chrono::Duration,
    log::debug,
    std::{
        collections::{btree_map::Entry, BTreeMap, BTreeSet},
        io::Write,
    },
};

/// Publishing behavior of a suite.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SuiteFeatures {
    /// Digests to compute for every index and list in `Release`.
    pub hashes: Vec<HashAlgorithm>,
    /// Emit `Valid-Until` this long after `Date`.
    pub valid_for: Option<Duration>,
    /// Variants each index is published in.
    pub compressions: Vec<Compression>,
    /// Publish `by-hash` aliases and set `Acquire-By-Hash`.
    pub by_hash: bool,
}

impl Default for SuiteFeatures {
    fn default() -> Self {
        Self {
            hashes: vec![HashAlgorithm::Md5, HashAlgorithm::Sha1, HashAlgorithm::Sha256],
            valid_for: None,
            compressions: vec![Compression::None, Compression::Gzip, Compression::Xz],
            by_hash: false,
        }
    }
}

/// A committed index file variant.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexObject {
    /// Path relative to `dists/<suite>/`.
    pub path: String,
    pub object: ObjectId,
    /// Digests of the stored bytes, each naming `path`.
    pub hashes: Vec<FileHash>,
}

struct IndexSink<W: Write> {
    compression: Compression,
    writer: CompressingWriter<MultiHashWriter<W>>,
}

/// Duplicates writes into every sink.
struct FanoutWriter<W: Write> {
    sinks: Vec<IndexSink<W>>,
}

impl<W: Write> Write for FanoutWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for sink in self.sinks.iter_mut() {
            sink.writer.write_all(buf)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.writer.flush()?;
        }

        Ok(())
    }
}

/// Streams paragraphs of one index file into every configured variant.
struct IndexWriter<W: Write> {
    path: String,
    writer: ControlParagraphWriter<FanoutWriter<W>>,
}

impl<W: Write> IndexWriter<W> {
    fn new<S: BlobStore<Writer = W>>(
        store: &S,
        path: String,
        hashes: &[HashAlgorithm],
        compressions: &[Compression],
    ) -> Result<Self> {
        let mut sinks = vec![];

        for compression in compressions {
            let hashed = MultiHashWriter::new(store.create()?, hashes);

            sinks.push(IndexSink {
                compression: *compression,
                writer: CompressingWriter::new(hashed, *compression)?,
            });
        }

        debug!("opened index writer for {}", path);

        Ok(Self {
            path,
            writer: ControlParagraphWriter::new(FanoutWriter { sinks }),
        })
    }

    fn write(&mut self, paragraph: &ControlParagraph) -> Result<()> {
        Ok(self.writer.write_paragraph(paragraph)?)
    }

    fn count(&self) -> usize {
        self.writer.count()
    }

    fn finish<S: BlobStore<Writer = W>>(self, store: &S) -> Result<Vec<IndexObject>> {
        let mut res = vec![];

        for sink in self.writer.into_inner().sinks {
            let path = format!("{}{}", self.path, sink.compression.extension());
            let (inner, hashes) = sink.writer.finish()?.finish(&path);

            res.push(IndexObject {
                object: store.commit(inner)?,
                path,
                hashes,
            });
        }

        Ok(res)
    }
}

/// Streams binary package entries into `<component>/binary-<arch>/Packages`.
pub struct PackageWriter<W: Write> {
    index: IndexWriter<W>,
}

impl<W: Write> PackageWriter<W> {
    /// Validate and append an entry.
    pub fn add(&mut self, package: &Package) -> Result<()> {
        package.validate()?;
        self.index.write(package)
    }

    /// Number of entries written.
    pub fn count(&self) -> usize {
        self.index.count()
    }
}

/// Streams source package entries into `<component>/source/Sources`.
pub struct SourceWriter<W: Write> {
    index: IndexWriter<W>,
}

impl<W: Write> SourceWriter<W> {
    pub fn add(&mut self, source: &Source) -> Result<()> {
        source.validate()?;
        self.index.write(source)
    }

    pub fn count(&self) -> usize {
        self.index.count()
    }
}

/// An area of a suite, e.g. `main`.
pub struct Component<'a, S: BlobStore> {
    store: &'a S,
    name: String,
    hashes: Vec<HashAlgorithm>,
    compressions: Vec<Compression>,
    packages: BTreeMap<String, PackageWriter<S::Writer>>,
    sources: Option<SourceWriter<S::Writer>>,
}

impl<'a, S: BlobStore> Component<'a, S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Architectures that received packages, sorted.
    pub fn architectures(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(|s| s.as_str())
    }

    pub fn has_sources(&self) -> bool {
        self.sources.is_some()
    }

    /// The writer for an architecture, created on first use.
    pub fn package_writer(&mut self, architecture: &str) -> Result<&mut PackageWriter<S::Writer>> {
        match self.packages.entry(architecture.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let index = IndexWriter::new(
                    self.store,
                    format!("{}/binary-{}/Packages", self.name, architecture),
                    &self.hashes,
                    &self.compressions,
                )?;

                Ok(entry.insert(PackageWriter { index }))
            }
        }
    }

    /// Append a package to the index for its architecture.
    ///
    /// Packages are written in the order they are added. A rejected first
    /// package leaves no index behind for its architecture.
    pub fn add_package(&mut self, package: &Package) -> Result<()> {
        let arch = package.architecture()?.to_string();
        let res = self.package_writer(&arch)?.add(package);

        if res.is_err() && self.packages.get(&arch).map(|w| w.count()) == Some(0) {
            self.packages.remove(&arch);
        }

        res
    }

    /// Add packages sorted by name then version.
    pub fn add_packages_sorted(&mut self, packages: impl IntoIterator<Item = Package>) -> Result<()> {
        let mut keyed = packages
            .into_iter()
            .map(|p| {
                p.validate()?;
                Ok((p.package()?.to_string(), p.version()?, p))
            })
            .collect::<Result<Vec<_>>>()?;

        keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        for (_, _, package) in keyed {
            self.add_package(&package)?;
        }

        Ok(())
    }

    /// Append a source package to the component's `Sources` index.
    pub fn add_source(&mut self, source: &Source) -> Result<()> {
        if self.sources.is_none() {
            let index = IndexWriter::new(
                self.store,
                format!("{}/source/Sources", self.name),
                &self.hashes,
                &self.compressions,
            )?;

            self.sources = Some(SourceWriter { index });
        }

        let res = match self.sources.as_mut() {
            Some(writer) => writer.add(source),
            None => Ok(()),
        };

        if res.is_err() && self.sources.as_ref().map(|w| w.count()) == Some(0) {
            self.sources = None;
        }

        res
    }

    fn finish(self) -> Result<Vec<IndexObject>> {
        let mut res = vec![];

        for (_, writer) in self.packages {
            res.extend(writer.index.finish(self.store)?);
        }
        if let Some(writer) = self.sources {
            res.extend(writer.index.finish(self.store)?);
        }

        Ok(res)
    }
}

/// Everything needed to build a `Release` once a suite's indices are committed.
#[derive(Clone, Debug)]
pub struct FinishedSuite {
    pub name: String,
    pub metadata: ReleaseMetadata,
    pub features: SuiteFeatures,
    pub components: BTreeSet<String>,
    pub architectures: BTreeSet<String>,
    pub indices: Vec<IndexObject>,
}

/// A distribution being assembled for publishing, e.g. `bullseye`.
pub struct Suite<'a, S: BlobStore> {
    store: &'a S,
    name: String,
    metadata: ReleaseMetadata,
    features: SuiteFeatures,
    components: BTreeMap<String, Component<'a, S>>,
}

impl<'a, S: BlobStore> Suite<'a, S> {
    pub fn new(
        store: &'a S,
        name: impl ToString,
        metadata: ReleaseMetadata,
        features: SuiteFeatures,
    ) -> Self {
        Self {
            store,
            name: name.to_string(),
            metadata,
            features,
            components: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn features(&self) -> &SuiteFeatures {
        &self.features
    }

    pub fn metadata(&self) -> &ReleaseMetadata {
        &self.metadata
    }

    /// Obtain a component, creating it if needed.
    pub fn component(&mut self, name: &str) -> &mut Component<'a, S> {
        let store = self.store;
        let features = &self.features;

        self.components
            .entry(name.to_string())
            .or_insert_with(|| Component {
                store,
                name: name.to_string(),
                hashes: features.hashes.clone(),
                compressions: features.compressions.clone(),
                packages: BTreeMap::new(),
                sources: None,
            })
    }

    pub fn components(&self) -> impl Iterator<Item = &Component<'a, S>> {
        self.components.values()
    }

    /// Shorthand for adding a package to a component.
    pub fn add_package(&mut self, component: &str, package: &Package) -> Result<()> {
        self.component(component).add_package(package)
    }

    /// Union of architectures across components.
    pub fn architectures(&self) -> BTreeSet<String> {
        self.components
            .values()
            .flat_map(|c| c.architectures().map(|a| a.to_string()))
            .collect()
    }

    /// Commit every index to the store.
    ///
    /// Components that received no content are dropped.
    pub fn finish(self) -> Result<FinishedSuite> {
        let architectures = self.architectures();
        let mut components = BTreeSet::new();
        let mut indices = vec![];

        for (name, component) in self.components {
            if component.packages.is_empty() && component.sources.is_none() {
                continue;
            }

            components.insert(name);
            indices.extend(component.finish()?);
        }

        Ok(FinishedSuite {
            name: self.name,
            metadata: self.metadata,
            features: self.features,
            components,
            architectures,
            indices,
        })
    }
}
