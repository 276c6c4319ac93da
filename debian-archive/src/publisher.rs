// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Publishing suites.

Publishing is two phased. [Publisher::engross()] commits every index, the
`Release` file and its signatures to the blob store and yields an [EngrossedSuite]
describing which object each path should point at. Nothing visible changes, and
the committed objects stay pinned so [Publisher::decruft()] leaves them alone.
Then [Publisher::link()] checks every object is present and swaps paths over to
the new objects: indices and their
`by-hash` aliases first, then `Release`, `Release.gpg` and finally `InRelease`.
Clients always see either the old root documents or indices already in place for
the new ones.

[Publisher::decruft()] deletes objects no path refers to anymore.
*/

use {
    crate::{
        error::{ArchiveError, Result},
        release::{Release, ReleaseBuilder},
        signing::SigningKey,
        store::{BlobStore, GcReport, ObjectId},
        suite::{FinishedSuite, Suite},
    },
    log::{debug, error, info},
    std::io::Write,
};

/// A suite whose content is committed but not yet visible.
///
/// Holds a store pin on each committed object until passed to
/// [Publisher::link()] or [Publisher::abandon()].
#[derive(Debug)]
pub struct EngrossedSuite {
    name: String,
    release: Release,
    links: Vec<(String, ObjectId)>,
    pinned: Vec<ObjectId>,
}

impl EngrossedSuite {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn release(&self) -> &Release {
        &self.release
    }

    /// Repository paths and their objects, in the order they will be linked.
    pub fn links(&self) -> &[(String, ObjectId)] {
        &self.links
    }
}

/// A suite whose paths have all been swapped.
#[derive(Clone, Debug)]
pub struct PublishedSuite {
    pub name: String,
    pub release: Release,
    /// Paths linked, in link order.
    pub paths: Vec<String>,
}

/// Commits suites to a [BlobStore].
pub struct Publisher<'a, S: BlobStore> {
    store: &'a S,
    signing_key: Option<SigningKey>,
    allow_unsigned: bool,
}

impl<'a, S: BlobStore> Publisher<'a, S> {
    pub fn new(store: &'a S, signing_key: Option<SigningKey>) -> Self {
        Self {
            store,
            signing_key,
            allow_unsigned: false,
        }
    }

    /// Permit publishing only an unsigned `Release` when no signing key is set.
    pub fn set_allow_unsigned(&mut self, value: bool) {
        self.allow_unsigned = value;
    }

    fn store_bytes(&self, data: &[u8], pinned: &mut Vec<ObjectId>) -> Result<ObjectId> {
        let mut writer = self.store.create()?;
        writer.write_all(data)?;

        let object = self.store.commit(writer)?;
        pinned.push(object.clone());

        Ok(object)
    }

    fn unpin_all(&self, pinned: &[ObjectId]) {
        for object in pinned {
            self.store.unpin(object);
        }
    }

    /// Commit a suite's indices and root documents without touching published paths.
    pub fn engross(&self, suite: Suite<'_, S>) -> Result<EngrossedSuite> {
        if self.signing_key.is_none() && !self.allow_unsigned {
            return Err(ArchiveError::NoSigningKey);
        }

        let finished = suite.finish()?;
        let mut pinned = finished
            .indices
            .iter()
            .map(|index| index.object.clone())
            .collect::<Vec<_>>();

        match self.engross_finished(finished, &mut pinned) {
            Ok((name, release, links)) => Ok(EngrossedSuite {
                name,
                release,
                links,
                pinned,
            }),
            Err(e) => {
                self.unpin_all(&pinned);
                Err(e)
            }
        }
    }

    fn engross_finished(
        &self,
        finished: FinishedSuite,
        pinned: &mut Vec<ObjectId>,
    ) -> Result<(String, Release, Vec<(String, ObjectId)>)> {
        let dists = format!("dists/{}", finished.name);

        info!(
            "engrossing suite {} ({} index files)",
            finished.name,
            finished.indices.len()
        );

        let mut builder = ReleaseBuilder::new(finished.metadata.clone());
        if let Some(valid_for) = finished.features.valid_for {
            builder.set_valid_for(valid_for);
        }
        if finished.features.by_hash {
            builder.set_acquire_by_hash(true);
        }
        for component in &finished.components {
            builder.add_component(component);
        }
        for arch in &finished.architectures {
            builder.add_architecture(arch);
        }

        let mut links = vec![];

        for index in &finished.indices {
            builder.add_index(index.hashes.iter().cloned());
            links.push((format!("{}/{}", dists, index.path), index.object.clone()));

            if finished.features.by_hash {
                for hash in &index.hashes {
                    links.push((
                        format!("{}/{}", dists, hash.by_hash_path()),
                        index.object.clone(),
                    ));
                }
            }
        }

        let release = builder.build(&finished.name)?;
        let release_bytes = release.to_bytes();
        links.push((
            format!("{}/Release", dists),
            self.store_bytes(&release_bytes, pinned)?,
        ));

        if let Some(key) = &self.signing_key {
            let detached = key.detached_sign(&release_bytes)?;
            links.push((
                format!("{}/Release.gpg", dists),
                self.store_bytes(detached.as_bytes(), pinned)?,
            ));

            let text = String::from_utf8_lossy(&release_bytes);
            let inline = key.clearsign(&text)?;
            links.push((
                format!("{}/InRelease", dists),
                self.store_bytes(inline.as_bytes(), pinned)?,
            ));
        } else {
            info!("publishing {} without signatures", finished.name);
        }

        Ok((finished.name, release, links))
    }

    /// Make an engrossed suite visible.
    ///
    /// A missing object fails the call before any path is swapped. A failure part
    /// way leaves already swapped paths in place and is reported as
    /// [ArchiveError::LinkIncomplete]. Either way the suite's pins are released.
    pub fn link(&self, engrossed: EngrossedSuite) -> Result<PublishedSuite> {
        let res = self.link_paths(&engrossed);
        self.unpin_all(&engrossed.pinned);

        let linked = res?;
        info!("published suite {} ({} paths)", engrossed.name, linked.len());

        Ok(PublishedSuite {
            name: engrossed.name,
            release: engrossed.release,
            paths: linked,
        })
    }

    /// Release an engrossed suite's objects without making it visible.
    pub fn abandon(&self, engrossed: EngrossedSuite) {
        debug!("abandoning engrossed suite {}", engrossed.name);
        self.unpin_all(&engrossed.pinned);
    }

    fn link_paths(&self, engrossed: &EngrossedSuite) -> Result<Vec<String>> {
        if let Some((path, object)) = engrossed
            .links
            .iter()
            .find(|(_, object)| !self.store.contains(object))
        {
            error!("object {} for {} is missing; nothing linked", object, path);
            return Err(ArchiveError::NotFound(format!("object {}", object)));
        }

        let mut linked = vec![];

        for (path, object) in &engrossed.links {
            if let Err(e) = self.store.link(object, path) {
                error!(
                    "linking {} failed after swapping {} paths: {}",
                    path,
                    linked.len(),
                    e
                );
                for done in &linked {
                    error!("already linked: {}", done);
                }

                return Err(ArchiveError::LinkIncomplete {
                    failed: path.clone(),
                    linked,
                    source: Box::new(e),
                });
            }

            debug!("linked {}", path);
            linked.push(path.clone());
        }

        Ok(linked)
    }

    /// Engross then link.
    pub fn publish(&self, suite: Suite<'_, S>) -> Result<PublishedSuite> {
        let engrossed = self.engross(suite)?;
        self.link(engrossed)
    }

    /// Remove objects not linked from any path.
    pub fn decruft(&self) -> Result<GcReport> {
        self.store.gc()
    }
}
