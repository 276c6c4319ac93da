// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Name to version indexes of index entries.

[PackageMap] and [SourceMap] group entries by package name, newest version first,
and resolve relationship [Possibility] instances against them.
*/

use {
    crate::{
        archive::IndexReader,
        control::ControlParagraph,
        dependency::Possibility,
        error::{ArchiveError, Result},
        package::Package,
        package_version::PackageVersion,
        source::Source,
    },
    std::collections::HashMap,
};

/// An index entry with a name and a version.
pub trait Versioned {
    fn name(&self) -> Result<&str>;

    fn version(&self) -> Result<PackageVersion>;
}

impl Versioned for Package {
    fn name(&self) -> Result<&str> {
        self.package()
    }

    fn version(&self) -> Result<PackageVersion> {
        Package::version(self)
    }
}

impl Versioned for Source {
    fn name(&self) -> Result<&str> {
        self.package()
    }

    fn version(&self) -> Result<PackageVersion> {
        Source::version(self)
    }
}

/// Entries grouped by name, each group sorted by descending version.
#[derive(Clone, Debug)]
pub struct VersionMap<T> {
    entries: HashMap<String, Vec<(PackageVersion, T)>>,
}

impl<T> Default for VersionMap<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

pub type PackageMap = VersionMap<Package>;
pub type SourceMap = VersionMap<Source>;

impl<T: Versioned + From<ControlParagraph>> VersionMap<T> {
    /// Add an entry, keeping its group ordered.
    ///
    /// Entries with equal versions keep insertion order.
    pub fn insert(&mut self, entry: T) -> Result<()> {
        let name = entry.name()?.to_string();
        let version = entry.version()?;

        let group = self.entries.entry(name).or_default();
        let pos = group.partition_point(|(v, _)| v >= &version);
        group.insert(pos, (version, entry));

        Ok(())
    }

    /// Build from entries, stopping at the first error.
    pub fn from_entries(entries: impl IntoIterator<Item = Result<T>>) -> Result<Self> {
        let mut map = Self::default();

        for entry in entries {
            map.insert(entry?)?;
        }

        Ok(map)
    }

    /// Build from a verified index.
    ///
    /// The index is read to exhaustion. A read or verification error discards
    /// everything.
    pub async fn load(mut reader: IndexReader<T>) -> Result<Self> {
        let mut map = Self::default();

        while let Some(entry) = reader.read_entry().await? {
            map.insert(entry)?;
        }

        Ok(map)
    }

    /// Every entry of a name, newest first.
    pub fn get(&self, name: &str) -> impl Iterator<Item = &T> {
        self.entries
            .get(name)
            .into_iter()
            .flat_map(|group| group.iter().map(|(_, entry)| entry))
    }

    /// The newest entry of a name.
    pub fn newest(&self, name: &str) -> Option<&T> {
        self.get(name).next()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of distinct names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }
}

impl SourceMap {
    /// Position within [Self::get()] of the newest source satisfying `possibility`.
    pub fn matches(&self, possibility: &Possibility) -> Result<usize> {
        if possibility.architecture.is_some() {
            return Err(ArchiveError::SourcePossibilityHasArchitecture(
                possibility.to_string(),
            ));
        }

        let candidates = self
            .entries
            .get(&possibility.package)
            .filter(|group| !group.is_empty())
            .ok_or_else(|| ArchiveError::UnknownSource(possibility.package.clone()))?;

        candidates
            .iter()
            .position(|(version, _)| possibility.satisfied_by(version))
            .ok_or_else(|| {
                ArchiveError::NoSatisfyingVersion(
                    possibility.package.clone(),
                    possibility.to_string(),
                )
            })
    }

    /// The newest source satisfying `possibility`.
    pub fn resolve(&self, possibility: &Possibility) -> Result<&Source> {
        let index = self.matches(possibility)?;

        self.get(&possibility.package)
            .nth(index)
            .ok_or_else(|| ArchiveError::UnknownSource(possibility.package.clone()))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::suite::tests::package};

    fn source(name: &str, version: &str) -> Source {
        let mut source = Source::default();
        source.set("Package", name);
        source.set("Version", version);
        source.set("Directory", format!("pool/{}/{}", &name[0..1], name));
        source
    }

    fn versions<T: Versioned + From<ControlParagraph>>(map: &VersionMap<T>, name: &str) -> Vec<String> {
        map.get(name)
            .map(|e| e.version().unwrap().to_string())
            .collect()
    }

    #[test]
    fn descending_order() -> Result<()> {
        let map = PackageMap::from_entries(
            ["1.0-1", "1:0.1", "1.0-10", "1.0~rc1", "1.0-2"]
                .into_iter()
                .map(|v| Ok(package("a", v, "amd64"))),
        )?;

        assert_eq!(
            versions(&map, "a"),
            vec!["1:0.1", "1.0-10", "1.0-2", "1.0-1", "1.0~rc1"]
        );
        assert_eq!(map.newest("a").map(|p| p.version_str().unwrap()), Some("1:0.1"));
        assert_eq!(map.len(), 1);
        assert!(map.get("b").next().is_none());

        Ok(())
    }

    #[test]
    fn load_aborts_on_error() {
        let entries = vec![
            Ok(package("a", "1.0", "amd64")),
            Err(ArchiveError::Other("broken".into())),
            Ok(package("b", "1.0", "amd64")),
        ];

        assert!(matches!(
            PackageMap::from_entries(entries),
            Err(ArchiveError::Other(_))
        ));
    }

    #[test]
    fn source_matches() -> Result<()> {
        let map = SourceMap::from_entries(
            [("hello", "2.10-2"), ("hello", "2.9-1"), ("hello", "2.10-1"), ("bash", "5.1-2")]
                .into_iter()
                .map(|(n, v)| Ok(source(n, v))),
        )?;

        assert_eq!(versions(&map, "hello"), vec!["2.10-2", "2.10-1", "2.9-1"]);

        assert_eq!(map.matches(&"hello".parse()?)?, 0);
        assert_eq!(map.matches(&"hello (<< 2.10-2)".parse()?)?, 1);
        assert_eq!(map.matches(&"hello (<= 2.9-1)".parse()?)?, 2);
        assert_eq!(
            map.resolve(&"hello (= 2.10-1)".parse()?)?.version()?.to_string(),
            "2.10-1"
        );

        assert!(matches!(
            map.matches(&"hello (>> 3.0)".parse()?),
            Err(ArchiveError::NoSatisfyingVersion(..))
        ));
        assert!(matches!(
            map.matches(&"zsh".parse()?),
            Err(ArchiveError::UnknownSource(_))
        ));
        assert!(matches!(
            map.matches(&"hello:amd64".parse()?),
            Err(ArchiveError::SourcePossibilityHasArchitecture(_))
        ));

        Ok(())
    }
}
