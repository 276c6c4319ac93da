// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! YAML driven publishing of a suite. */

use {
    crate::cli::{DrtError, Result},
    chrono::Duration,
    debian_archive::{
        hash::HashAlgorithm,
        io::Compression,
        pool::Pool,
        publisher::{PublishedSuite, Publisher},
        release::ReleaseMetadata,
        signing::SigningKey,
        store::{FilesystemBlobStore, GcReport},
        suite::{Suite, SuiteFeatures},
    },
    log::warn,
    pbr::ProgressBar,
    serde::Deserialize,
    std::{
        collections::BTreeMap,
        io::Stdout,
        path::{Path, PathBuf},
    },
};

/// Files to publish in a component.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ComponentConfig {
    pub debs: Vec<PathBuf>,
    pub dscs: Vec<PathBuf>,
}

fn default_hashes() -> Vec<HashAlgorithm> {
    SuiteFeatures::default().hashes
}

fn default_compressions() -> Vec<Compression> {
    SuiteFeatures::default().compressions
}

/// Describes a suite to publish.
///
/// Relative paths are resolved against the directory of the YAML file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PublishConfig {
    /// Root directory of the repository.
    pub repository: PathBuf,
    /// Suite name, used for `dists/<suite>`.
    pub suite: String,
    #[serde(default)]
    pub metadata: ReleaseMetadata,
    /// Armored secret key signing `Release`.
    #[serde(default)]
    pub signing_key: Option<PathBuf>,
    /// Environment variable holding the signing key passphrase.
    #[serde(default)]
    pub signing_key_passphrase_env: Option<String>,
    #[serde(default)]
    pub allow_unsigned: bool,
    #[serde(default = "default_hashes")]
    pub hashes: Vec<HashAlgorithm>,
    #[serde(default = "default_compressions")]
    pub compressions: Vec<Compression>,
    #[serde(default)]
    pub valid_for_days: Option<i64>,
    #[serde(default)]
    pub by_hash: bool,
    /// Remove unreferenced objects after publishing.
    #[serde(default)]
    pub decruft: bool,
    pub components: BTreeMap<String, ComponentConfig>,
}

impl PublishConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let f = std::fs::File::open(path)?;
        let config: Self = serde_yaml::from_reader(f)?;

        Ok(config.resolve_paths(path.parent().unwrap_or_else(|| Path::new(""))))
    }

    fn resolve_paths(mut self, base: &Path) -> Self {
        self.repository = base.join(&self.repository);
        self.signing_key = self.signing_key.map(|p| base.join(p));

        for component in self.components.values_mut() {
            for path in component.debs.iter_mut().chain(component.dscs.iter_mut()) {
                *path = base.join(&*path);
            }
        }

        self
    }

    fn features(&self) -> SuiteFeatures {
        SuiteFeatures {
            hashes: self.hashes.clone(),
            valid_for: self.valid_for_days.map(Duration::days),
            compressions: self.compressions.clone(),
            by_hash: self.by_hash,
        }
    }

    fn load_signing_key(&self) -> Result<Option<SigningKey>> {
        let path = match &self.signing_key {
            Some(path) => path,
            None => return Ok(None),
        };

        let passphrase = match &self.signing_key_passphrase_env {
            Some(var) => {
                Some(std::env::var(var).map_err(|_| DrtError::MissingEnvironment(var.clone()))?)
            }
            None => None,
        };

        Ok(Some(SigningKey::from_path(path, passphrase.as_deref())?))
    }

    /// Number of `.deb` and `.dsc` files to ingest.
    pub fn file_count(&self) -> usize {
        self.components
            .values()
            .map(|c| c.debs.len() + c.dscs.len())
            .sum()
    }
}

/// Outcome of [publish()].
#[derive(Debug)]
pub struct PublishReport {
    pub suite: PublishedSuite,
    pub packages: usize,
    pub sources: usize,
    pub decruft: Option<GcReport>,
}

/// Ingest every configured file into the pool and publish the suite.
pub fn publish(
    config: &PublishConfig,
    mut progress: Option<&mut ProgressBar<Stdout>>,
) -> Result<PublishReport> {
    // Fail before copying anything into the pool.
    let signing_key = config.load_signing_key()?;
    if signing_key.is_none() && !config.allow_unsigned {
        return Err(debian_archive::error::ArchiveError::NoSigningKey.into());
    }

    let store = FilesystemBlobStore::new(&config.repository)?;
    let pool = Pool::new(&store);
    let mut suite = Suite::new(
        &store,
        &config.suite,
        config.metadata.clone(),
        config.features(),
    );

    let mut package_count = 0;
    let mut source_count = 0;

    for (name, component_config) in &config.components {
        let component = suite.component(name);

        let mut packages = vec![];
        for path in &component_config.debs {
            packages.push(pool.include_deb(path)?);
            if let Some(pb) = progress.as_deref_mut() {
                pb.inc();
            }
        }
        package_count += packages.len();
        component.add_packages_sorted(packages)?;

        for path in &component_config.dscs {
            let included = pool.include_sources(path)?;
            component.add_source(&included.source)?;
            source_count += 1;
            if let Some(pb) = progress.as_deref_mut() {
                pb.inc();
            }
        }

        if component_config.debs.is_empty() && component_config.dscs.is_empty() {
            warn!("component {} has no files; it will not be advertised", name);
        }
    }

    if let Some(pb) = progress {
        pb.finish();
    }

    let mut publisher = Publisher::new(&store, signing_key);
    publisher.set_allow_unsigned(config.allow_unsigned);

    let published = publisher.publish(suite)?;

    let decruft = if config.decruft {
        Some(publisher.decruft()?)
    } else {
        None
    };

    Ok(PublishReport {
        suite: published,
        packages: package_count,
        sources: source_count,
        decruft,
    })
}

#[cfg(test)]
mod tests {
    use {super::*, debian_archive::error::ArchiveError};

    fn write_source(dir: &Path) -> std::io::Result<()> {
        let orig = b"upstream tarball";
        let mut digester = HashAlgorithm::Md5.new_digester();
        digester.update(orig);

        std::fs::write(dir.join("hello_1.0.orig.tar.gz"), orig)?;
        std::fs::write(
            dir.join("hello_1.0-1.dsc"),
            format!(
                "Format: 3.0 (quilt)\nSource: hello\nVersion: 1.0-1\n\
                 Files:\n {} {} hello_1.0.orig.tar.gz\n",
                hex::encode(digester.finalize()),
                orig.len()
            ),
        )
    }

    #[test]
    fn parse_config() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("publish.yaml");
        std::fs::write(
            &path,
            "repository: repo\n\
             suite: stable\n\
             metadata:\n  origin: Example\n  codename: bookworm\n\
             hashes: [sha256, sha512]\n\
             valid_for_days: 7\n\
             components:\n  main:\n    debs: [a.deb]\n  contrib: {}\n",
        )?;

        let config = PublishConfig::from_path(&path)?;
        assert_eq!(config.repository, td.path().join("repo"));
        assert_eq!(config.metadata.origin.as_deref(), Some("Example"));
        assert_eq!(config.hashes, vec![HashAlgorithm::Sha256, HashAlgorithm::Sha512]);
        assert_eq!(config.compressions, default_compressions());
        assert_eq!(config.components["main"].debs, vec![td.path().join("a.deb")]);
        assert!(config.components["contrib"].dscs.is_empty());
        assert_eq!(config.features().valid_for, Some(Duration::days(7)));
        assert!(!config.decruft);

        std::fs::write(&path, "repository: repo\nsuite: stable\ncomponents: {}\nbogus: 1\n")?;
        assert!(matches!(
            PublishConfig::from_path(&path),
            Err(DrtError::SerdeYaml(_))
        ));

        Ok(())
    }

    #[test]
    fn publish_unsigned_sources() -> Result<()> {
        let td = tempfile::tempdir()?;
        write_source(td.path())?;

        let path = td.path().join("publish.yaml");
        std::fs::write(
            &path,
            "repository: repo\n\
             suite: test\n\
             allow_unsigned: true\n\
             decruft: true\n\
             components:\n  main:\n    dscs: [hello_1.0-1.dsc]\n",
        )?;

        let report = publish(&PublishConfig::from_path(&path)?, None)?;
        assert_eq!(report.sources, 1);
        assert_eq!(report.packages, 0);
        assert_eq!(report.suite.paths.last().map(|s| s.as_str()), Some("dists/test/Release"));
        assert!(report.decruft.is_some());

        let repo = td.path().join("repo");
        assert!(repo.join("pool/h/hello/hello_1.0-1.dsc").exists());
        assert!(repo.join("pool/h/hello/hello_1.0.orig.tar.gz").exists());
        assert!(repo.join("dists/test/main/source/Sources.xz").exists());
        assert!(!repo.join("dists/test/InRelease").exists());

        Ok(())
    }

    #[test]
    fn signing_required() -> Result<()> {
        let td = tempfile::tempdir()?;
        let config = PublishConfig {
            repository: td.path().join("repo"),
            suite: "test".into(),
            metadata: ReleaseMetadata::default(),
            signing_key: None,
            signing_key_passphrase_env: None,
            allow_unsigned: false,
            hashes: default_hashes(),
            compressions: default_compressions(),
            valid_for_days: None,
            by_hash: false,
            decruft: false,
            components: BTreeMap::new(),
        };

        assert!(matches!(
            publish(&config, None),
            Err(DrtError::Archive(ArchiveError::NoSigningKey))
        ));
        assert!(!td.path().join("repo").exists());

        Ok(())
    }
}
