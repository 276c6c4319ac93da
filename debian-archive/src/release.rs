// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `Release` files.

A `Release` file is the root of trust of a suite. It is a single control paragraph
describing the suite and listing the digest and size of every index file beneath
`dists/<suite>/`, once per digest algorithm.

[Release] wraps a parsed paragraph. [ReleaseBuilder] assembles a new one from
suite metadata and the digests of freshly written indices.
*/

use {
    crate::{
        control::{ControlField, ControlParagraph, ControlParagraphReader},
        error::{ArchiveError, Result},
        hash::{FileHash, HashAlgorithm},
    },
    chrono::{DateTime, Duration, SubsecRound, Utc},
    serde::Deserialize,
    std::{
        collections::{BTreeMap, BTreeSet},
        io::BufRead,
        ops::{Deref, DerefMut},
    },
};

/// Formatter string for dates in `Release` files.
pub const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

/// A parsed `Release` file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Release {
    paragraph: ControlParagraph,
}

impl Deref for Release {
    type Target = ControlParagraph;

    fn deref(&self) -> &Self::Target {
        &self.paragraph
    }
}

impl DerefMut for Release {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.paragraph
    }
}

impl From<ControlParagraph> for Release {
    fn from(paragraph: ControlParagraph) -> Self {
        Self { paragraph }
    }
}

impl From<Release> for ControlParagraph {
    fn from(r: Release) -> Self {
        r.paragraph
    }
}

impl Release {
    /// Construct an instance by reading data from a reader.
    ///
    /// The source must be a control file with exactly 1 paragraph. It must not be
    /// PGP armored: strip and verify `InRelease` content first.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut paragraphs = ControlParagraphReader::new(reader).collect::<Result<Vec<_>>>()?;

        if paragraphs.len() != 1 {
            return Err(ArchiveError::ReleaseControlParagraphMismatch(
                paragraphs.len(),
            ));
        }

        Ok(Self {
            paragraph: paragraphs.remove(0),
        })
    }

    /// Serialize to the bytes of a `Release` file.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.paragraph.to_string().into_bytes()
    }

    pub fn description(&self) -> Option<&str> {
        self.field_str("Description")
    }

    pub fn origin(&self) -> Option<&str> {
        self.field_str("Origin")
    }

    pub fn label(&self) -> Option<&str> {
        self.field_str("Label")
    }

    pub fn version(&self) -> Option<&str> {
        self.field_str("Version")
    }

    /// Suite of this repository. e.g. `stable`.
    pub fn suite(&self) -> Option<&str> {
        self.field_str("Suite")
    }

    pub fn codename(&self) -> Option<&str> {
        self.field_str("Codename")
    }

    /// Names of components within this suite.
    pub fn components(&self) -> Vec<&str> {
        self.iter_field_words("Components")
            .map(|words| words.collect())
            .unwrap_or_default()
    }

    /// Machine architectures this suite provides indices for.
    pub fn architectures(&self) -> Vec<&str> {
        self.iter_field_words("Architectures")
            .map(|words| words.collect())
            .unwrap_or_default()
    }

    /// Time the release file was created, normalized to UTC.
    pub fn date(&self) -> Option<Result<DateTime<Utc>>> {
        self.field_datetime_rfc5322("Date")
    }

    /// Time after which clients should consider the release file expired.
    pub fn valid_until(&self) -> Option<Result<DateTime<Utc>>> {
        self.field_datetime_rfc5322("Valid-Until")
    }

    pub fn not_automatic(&self) -> Option<bool> {
        self.field_bool("NotAutomatic")
    }

    pub fn but_automatic_upgrades(&self) -> Option<bool> {
        self.field_bool("ButAutomaticUpgrades")
    }

    /// Whether clients should fetch indices through `by-hash` paths.
    pub fn acquire_by_hash(&self) -> Option<bool> {
        self.field_bool("Acquire-By-Hash")
    }

    /// Iterate over index entries declared with an algorithm.
    ///
    /// Returns [None] if the `Release` has no field for that algorithm. Entries are
    /// parsed lazily.
    pub fn iter_index_files(
        &self,
        algorithm: HashAlgorithm,
    ) -> Option<impl Iterator<Item = Result<FileHash>> + '_> {
        self.iter_field_lines(algorithm.release_field_name())
            .map(move |lines| lines.map(move |line| FileHash::from_checksum_line(algorithm, line)))
    }

    /// Every index path with its strongest declared digest.
    ///
    /// Only strong algorithms are considered, so paths listed solely under `MD5Sum`
    /// or `SHA1` are absent. `SHA512` wins over `SHA256`.
    pub fn indices(&self) -> Result<BTreeMap<String, FileHash>> {
        let mut res = BTreeMap::new();

        for algorithm in HashAlgorithm::preferred_order().filter(|a| a.is_strong()) {
            if let Some(entries) = self.iter_index_files(algorithm) {
                for entry in entries {
                    let entry = entry?;
                    res.entry(entry.filename.clone()).or_insert(entry);
                }
            }
        }

        Ok(res)
    }

    /// Every declared digest of a single index path, across all algorithms.
    pub fn index_hashes(&self, path: &str) -> Result<Vec<FileHash>> {
        let mut res = vec![];

        for algorithm in HashAlgorithm::preferred_order() {
            if let Some(entries) = self.iter_index_files(algorithm) {
                for entry in entries {
                    let entry = entry?;
                    if entry.filename == path {
                        res.push(entry);
                    }
                }
            }
        }

        Ok(res)
    }
}

/// Descriptive fields of a suite's `Release` file.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReleaseMetadata {
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    /// The `Suite` field. Defaults to the suite name when unset.
    #[serde(default)]
    pub suite: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub codename: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub not_automatic: bool,
    #[serde(default)]
    pub but_automatic_upgrades: bool,
}

/// Assembles a [Release] from metadata and index digests.
#[derive(Clone, Debug)]
pub struct ReleaseBuilder {
    metadata: ReleaseMetadata,
    date: DateTime<Utc>,
    valid_for: Option<Duration>,
    acquire_by_hash: Option<bool>,
    components: BTreeSet<String>,
    architectures: BTreeSet<String>,
    entries: BTreeMap<String, Vec<FileHash>>,
}

impl ReleaseBuilder {
    /// Create a builder dated now.
    pub fn new(metadata: ReleaseMetadata) -> Self {
        Self {
            metadata,
            date: Utc::now().trunc_subsecs(0),
            valid_for: None,
            acquire_by_hash: None,
            components: BTreeSet::new(),
            architectures: BTreeSet::new(),
            entries: BTreeMap::new(),
        }
    }

    /// Override the `Date` of the release.
    pub fn set_date(&mut self, date: DateTime<Utc>) {
        self.date = date;
    }

    /// Emit `Valid-Until` at `Date` plus this duration.
    pub fn set_valid_for(&mut self, duration: Duration) {
        self.valid_for = Some(duration);
    }

    pub fn set_acquire_by_hash(&mut self, value: bool) {
        self.acquire_by_hash = Some(value);
    }

    pub fn add_component(&mut self, component: impl ToString) {
        self.components.insert(component.to_string());
    }

    pub fn add_architecture(&mut self, architecture: impl ToString) {
        self.architectures.insert(architecture.to_string());
    }

    /// Register digests of an index file.
    ///
    /// Paths are relative to `dists/<suite>/`.
    pub fn add_index(&mut self, hashes: impl IntoIterator<Item = FileHash>) {
        for hash in hashes {
            self.entries
                .entry(hash.filename.clone())
                .or_insert_with(Vec::new)
                .push(hash);
        }
    }

    /// Number of index files registered.
    pub fn index_count(&self) -> usize {
        self.entries.len()
    }

    /// Produce the [Release].
    ///
    /// Fails if some index lacks a strong digest.
    pub fn build(&self, suite_name: &str) -> Result<Release> {
        for (path, hashes) in &self.entries {
            if !hashes.iter().any(|h| h.algorithm.is_strong()) {
                return Err(ArchiveError::UndeclaredIndex(path.clone()));
            }
        }

        let mut para = ControlParagraph::default();
        let md = &self.metadata;

        if let Some(origin) = &md.origin {
            para.set("Origin", origin.as_str());
        }
        if let Some(label) = &md.label {
            para.set("Label", label.as_str());
        }
        para.set("Suite", md.suite.as_deref().unwrap_or(suite_name));
        if let Some(version) = &md.version {
            para.set("Version", version.as_str());
        }
        if let Some(codename) = &md.codename {
            para.set("Codename", codename.as_str());
        }

        para.set("Date", format!("{}", self.date.format(DATE_FORMAT)));
        if let Some(valid_for) = self.valid_for {
            para.set(
                "Valid-Until",
                format!("{}", (self.date + valid_for).format(DATE_FORMAT)),
            );
        }

        if md.not_automatic {
            para.set("NotAutomatic", "yes");
        }
        if md.but_automatic_upgrades {
            para.set("ButAutomaticUpgrades", "yes");
        }
        if let Some(by_hash) = self.acquire_by_hash {
            para.set("Acquire-By-Hash", if by_hash { "yes" } else { "no" });
        }

        para.set(
            "Architectures",
            self.architectures
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        );
        para.set(
            "Components",
            self.components
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        );
        if let Some(description) = &md.description {
            para.set("Description", description.as_str());
        }

        let mut by_algorithm: BTreeMap<HashAlgorithm, Vec<&FileHash>> = BTreeMap::new();
        for hash in self.entries.values().flatten() {
            by_algorithm.entry(hash.algorithm).or_default().push(hash);
        }

        for (algorithm, entries) in by_algorithm {
            let size_width = entries
                .iter()
                .map(|h| h.size.to_string().len())
                .max()
                .unwrap_or_default();

            para.set_field(ControlField::from_lines(
                algorithm.release_field_name(),
                std::iter::once(String::new()).chain(entries.iter().map(|h| {
                    format!(
                        "{} {:>width$} {}",
                        h.digest_hex(),
                        h.size,
                        h.filename,
                        width = size_width
                    )
                })),
            ));
        }

        Ok(para.into())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        chrono::TimeZone,
        indoc::indoc,
    };

    const BULLSEYE: &str = indoc! {"
        Origin: Debian
        Label: Debian
        Suite: stable
        Version: 11.1
        Codename: bullseye
        Date: Sat, 09 Oct 2021 09:34:56 +0000
        Acquire-By-Hash: yes
        Architectures: all amd64 arm64
        Components: main contrib non-free
        Description: Debian 11.1 Released 09 October 2021
        MD5Sum:
         7fdf4db15250af5368cc52a91e8edbce   738242 contrib/Contents-all
         cbd7bc4d3eb517ac2b22f929dfc07b47    57319 contrib/Contents-all.gz
        SHA256:
         3957f28db16e3f28c7b34ae84f1c929c567de6970f3f1b95dac9b498dd80fe63   738242 contrib/Contents-all
         3e9a121d599b56c08bc8f144e4830807c77c29d7114316d6984ba54695d3db7b    57319 contrib/Contents-all.gz
    "};

    #[test]
    fn parse_bullseye() -> Result<()> {
        let release = Release::from_reader(BULLSEYE.as_bytes())?;

        assert_eq!(release.suite(), Some("stable"));
        assert_eq!(release.codename(), Some("bullseye"));
        assert_eq!(release.components(), vec!["main", "contrib", "non-free"]);
        assert_eq!(release.architectures(), vec!["all", "amd64", "arm64"]);
        assert_eq!(release.acquire_by_hash(), Some(true));
        assert_eq!(release.not_automatic(), None);
        assert_eq!(
            release.date().unwrap()?,
            Utc.ymd(2021, 10, 9).and_hms(9, 34, 56)
        );
        assert!(release.valid_until().is_none());

        let md5 = release
            .iter_index_files(HashAlgorithm::Md5)
            .unwrap()
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(md5.len(), 2);
        assert_eq!(md5[1].size, 57319);
        assert!(release.iter_index_files(HashAlgorithm::Sha512).is_none());

        let indices = release.indices()?;
        assert_eq!(indices.len(), 2);
        assert_eq!(
            indices["contrib/Contents-all.gz"].algorithm,
            HashAlgorithm::Sha256
        );

        assert_eq!(release.index_hashes("contrib/Contents-all")?.len(), 2);

        Ok(())
    }

    #[test]
    fn paragraph_count() {
        assert!(matches!(
            Release::from_reader(b"A: b\n\nC: d\n".as_ref()),
            Err(ArchiveError::ReleaseControlParagraphMismatch(2))
        ));
    }

    fn hashes(path: &str, content: &[u8], algorithms: &[HashAlgorithm]) -> Vec<FileHash> {
        use std::io::Write;

        let mut writer = crate::hash::MultiHashWriter::new(std::io::sink(), algorithms);
        writer.write_all(content).unwrap();
        writer.finish(path).1
    }

    #[test]
    fn build_release() -> Result<()> {
        let mut builder = ReleaseBuilder::new(ReleaseMetadata {
            origin: Some("Example".into()),
            description: Some("Example packages".into()),
            ..Default::default()
        });
        builder.set_date(Utc.ymd(2021, 10, 9).and_hms(9, 34, 56));
        builder.set_valid_for(Duration::days(7));
        builder.set_acquire_by_hash(true);
        builder.add_component("main");
        builder.add_component("contrib");
        builder.add_component("main");
        builder.add_architecture("amd64");

        let algorithms = [HashAlgorithm::Md5, HashAlgorithm::Sha256];
        builder.add_index(hashes("main/binary-amd64/Packages", b"hello", &algorithms));
        builder.add_index(hashes(
            "main/binary-amd64/Packages.gz",
            &[0u8; 1024],
            &algorithms,
        ));
        assert_eq!(builder.index_count(), 2);

        let release = builder.build("test")?;
        let text = String::from_utf8(release.to_bytes()).unwrap();

        assert!(text.starts_with("Origin: Example\nSuite: test\nDate: Sat, 09 Oct 2021 09:34:56 +0000\n"));
        assert!(text.contains("Valid-Until: Sat, 16 Oct 2021 09:34:56 +0000\n"));
        assert!(text.contains("Components: contrib main\n"));
        assert!(text.contains(
            " 2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824    5 main/binary-amd64/Packages\n"
        ));

        let parsed = Release::from_reader(text.as_bytes())?;
        assert_eq!(parsed, release);
        assert_eq!(parsed.components(), vec!["contrib", "main"]);
        let indices = parsed.indices()?;
        assert_eq!(indices["main/binary-amd64/Packages"].size, 5);
        assert_eq!(
            parsed.valid_until().unwrap()?,
            Utc.ymd(2021, 10, 16).and_hms(9, 34, 56)
        );

        Ok(())
    }

    #[test]
    fn build_requires_strong_digest() {
        let mut builder = ReleaseBuilder::new(ReleaseMetadata::default());
        builder.add_index(hashes(
            "main/binary-amd64/Packages",
            b"",
            &[HashAlgorithm::Md5, HashAlgorithm::Sha1],
        ));

        assert!(matches!(
            builder.build("test"),
            Err(ArchiveError::UndeclaredIndex(p)) if p == "main/binary-amd64/Packages"
        ));
    }
}
