// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Source package index entries.

Paragraphs in `Sources` indices follow the `.dsc` format with a few changes: the
`Source` field is renamed to `Package`, and a mandatory `Directory` field names the
pool directory holding the source files.
*/

use {
    crate::{
        control::ControlParagraph,
        dependency::DependencyList,
        error::{ArchiveError, Result},
        hash::{FileHash, HashAlgorithm},
        package_version::PackageVersion,
    },
    std::ops::{Deref, DerefMut},
};

const KIND: &str = "Source";

/// A source package entry in a `Sources` index.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Source {
    paragraph: ControlParagraph,
}

impl Deref for Source {
    type Target = ControlParagraph;

    fn deref(&self) -> &Self::Target {
        &self.paragraph
    }
}

impl DerefMut for Source {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.paragraph
    }
}

impl From<ControlParagraph> for Source {
    fn from(paragraph: ControlParagraph) -> Self {
        Self { paragraph }
    }
}

impl From<Source> for ControlParagraph {
    fn from(s: Source) -> Self {
        s.paragraph
    }
}

impl Source {
    /// Convert a `.dsc` paragraph into an index entry placed in `directory`.
    ///
    /// `Source` becomes `Package` and `Directory` is set.
    pub fn from_dsc(mut dsc: ControlParagraph, directory: &str) -> Result<Self> {
        let name = dsc
            .remove_field("Source")
            .ok_or(ArchiveError::ControlRequiredFieldMissing(".dsc", "Source"))?;

        let mut paragraph = ControlParagraph::default();
        paragraph.set("Package", name.value_str());
        paragraph.set("Directory", directory);

        for field in dsc.iter_fields() {
            paragraph.set_field(field.clone());
        }

        Ok(Self { paragraph })
    }

    pub fn validate(&self) -> Result<()> {
        self.directory()?;

        if self.has_field("Version") {
            self.version()?;
        }

        Ok(())
    }

    /// The pool directory holding the source files.
    pub fn directory(&self) -> Result<&str> {
        self.required_field_str(KIND, "Directory")
    }

    /// The `Package` field, falling back to `Source`.
    pub fn package(&self) -> Result<&str> {
        self.field_str("Package")
            .or_else(|| self.field_str("Source"))
            .ok_or(ArchiveError::ControlRequiredFieldMissing(KIND, "Package"))
    }

    pub fn version(&self) -> Result<PackageVersion> {
        Ok(PackageVersion::parse(
            self.required_field_str(KIND, "Version")?,
        )?)
    }

    pub fn format(&self) -> Option<&str> {
        self.field_str("Format")
    }

    pub fn priority(&self) -> Option<&str> {
        self.field_str("Priority")
    }

    pub fn section(&self) -> Option<&str> {
        self.field_str("Section")
    }

    pub fn maintainer(&self) -> Option<&str> {
        self.field_str("Maintainer")
    }

    pub fn homepage(&self) -> Option<&str> {
        self.field_str("Homepage")
    }

    pub fn standards_version(&self) -> Option<&str> {
        self.field_str("Standards-Version")
    }

    /// Binary packages built from this source (`Binary`, comma delimited).
    pub fn binaries(&self) -> Vec<&str> {
        split_list(self.field_str("Binary"))
    }

    /// Comma delimited `Uploaders`.
    pub fn uploaders(&self) -> Vec<&str> {
        split_list(self.field_str("Uploaders"))
    }

    /// Architectures listed by `Architecture`.
    pub fn architectures(&self) -> Vec<&str> {
        self.iter_field_words("Architecture")
            .map(|words| words.collect())
            .unwrap_or_default()
    }

    /// Parse `Build-Depends`.
    ///
    /// Parsing happens on every call; the paragraph only stores text.
    pub fn build_depends(&self) -> Result<Option<DependencyList>> {
        self.field_str("Build-Depends")
            .map(DependencyList::parse)
            .transpose()
    }

    /// Entries of a checksums field with the given algorithm.
    fn checksums(&self, field: &str, algorithm: HashAlgorithm) -> Result<Vec<FileHash>> {
        match self.iter_field_lines(field) {
            Some(lines) => lines
                .map(|line| FileHash::from_checksum_line(algorithm, line))
                .collect(),
            None => Ok(vec![]),
        }
    }

    /// `Checksums-Sha1` entries.
    pub fn checksums_sha1(&self) -> Result<Vec<FileHash>> {
        self.checksums("Checksums-Sha1", HashAlgorithm::Sha1)
    }

    /// `Checksums-Sha256` entries.
    pub fn checksums_sha256(&self) -> Result<Vec<FileHash>> {
        self.checksums("Checksums-Sha256", HashAlgorithm::Sha256)
    }

    /// `Files` entries, which carry MD5 digests.
    pub fn files(&self) -> Result<Vec<FileHash>> {
        self.checksums("Files", HashAlgorithm::Md5)
    }
}

fn split_list(value: Option<&str>) -> Vec<&str> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use {super::*, crate::control::parse_paragraphs, indoc::indoc};

    const DSC: &str = indoc! {"
        Format: 3.0 (quilt)
        Source: hello
        Binary: hello, hello-doc
        Architecture: any all
        Version: 2.10-2
        Maintainer: Santiago Vila <sanvila@debian.org>
        Standards-Version: 4.5.0
        Build-Depends: debhelper-compat (= 12), gettext [!hurd-any]
        Checksums-Sha256:
         31e066137a962676e89f69d1b65382de95a7ef7d914b8cb956f41ea72e0f516b 725946 hello_2.10.orig.tar.gz
         811ad0255495279fc98dc75f4460da1722f5c1030740cb52638cb80d0fdb24f0 12688 hello_2.10-2.debian.tar.xz
        Files:
         6cd0ffea3884a4e79330338dcc2987d6 725946 hello_2.10.orig.tar.gz
         e6074bb23a0f184e00fdfb5c546b3bc2 12688 hello_2.10-2.debian.tar.xz
    "};

    #[test]
    fn from_dsc() -> Result<()> {
        let dsc = parse_paragraphs(DSC)?.remove(0);
        let source = Source::from_dsc(dsc, "pool/h/hello")?;
        source.validate()?;

        assert_eq!(source.iter_fields().next().map(|f| f.name()), Some("Package"));
        assert!(!source.has_field("Source"));
        assert_eq!(source.package()?, "hello");
        assert_eq!(source.directory()?, "pool/h/hello");
        assert_eq!(source.binaries(), vec!["hello", "hello-doc"]);
        assert_eq!(source.architectures(), vec!["any", "all"]);
        assert_eq!(source.version()?.to_string(), "2.10-2");

        let files = source.files()?;
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].filename, "hello_2.10-2.debian.tar.xz");
        assert_eq!(files[1].size, 12688);
        assert_eq!(source.checksums_sha256()?.len(), 2);
        assert!(source.checksums_sha1()?.is_empty());

        let deps = source.build_depends()?.unwrap();
        assert_eq!(deps.dependencies.len(), 2);

        Ok(())
    }

    #[test]
    fn directory_required() -> Result<()> {
        let mut source = Source::from(parse_paragraphs("Package: foo\n")?.remove(0));
        assert!(matches!(
            source.validate(),
            Err(ArchiveError::ControlRequiredFieldMissing("Source", "Directory"))
        ));

        source.set("Directory", "pool/f/foo");
        source.validate()?;
        assert!(source.build_depends()?.is_none());

        Ok(())
    }
}
