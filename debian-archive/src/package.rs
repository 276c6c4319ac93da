// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Binary package index entries.

A [Package] is one paragraph of a `Packages` index file. It is a thin typed wrapper
around a [ControlParagraph]. [Deref] and [DerefMut] expose the inner paragraph and
[From] converts in both directions.
*/

use {
    crate::{
        control::ControlParagraph,
        error::{ArchiveError, Result},
        hash::{FileHash, HashAlgorithm},
        package_version::PackageVersion,
    },
    std::ops::{Deref, DerefMut},
};

const KIND: &str = "Package";

/// Fields every index entry must carry.
pub const REQUIRED_FIELDS: &[&str] = &[
    "Package",
    "Version",
    "Architecture",
    "Maintainer",
    "Description",
    "Filename",
    "Size",
];

/// A binary package entry in a `Packages` index.
///
/// Fields marked mandatory have getters returning [Result]. Everything else returns
/// [Option].
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Package {
    paragraph: ControlParagraph,
}

impl Deref for Package {
    type Target = ControlParagraph;

    fn deref(&self) -> &Self::Target {
        &self.paragraph
    }
}

impl DerefMut for Package {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.paragraph
    }
}

impl From<ControlParagraph> for Package {
    fn from(paragraph: ControlParagraph) -> Self {
        Self { paragraph }
    }
}

impl From<Package> for ControlParagraph {
    fn from(p: Package) -> Self {
        p.paragraph
    }
}

impl Package {
    /// Ensure the entry can be written to an index.
    ///
    /// Every mandatory field must be present and `Version` and `Size` must parse.
    pub fn validate(&self) -> Result<()> {
        for name in REQUIRED_FIELDS {
            self.required_field_str(KIND, *name)?;
        }

        self.version()?;
        self.size()?;

        Ok(())
    }

    /// The `Package` field.
    pub fn package(&self) -> Result<&str> {
        self.required_field_str(KIND, "Package")
    }

    pub fn version_str(&self) -> Result<&str> {
        self.required_field_str(KIND, "Version")
    }

    /// The `Version` field parsed into a [PackageVersion].
    pub fn version(&self) -> Result<PackageVersion> {
        Ok(PackageVersion::parse(self.version_str()?)?)
    }

    pub fn architecture(&self) -> Result<&str> {
        self.required_field_str(KIND, "Architecture")
    }

    pub fn maintainer(&self) -> Result<&str> {
        self.required_field_str(KIND, "Maintainer")
    }

    pub fn description(&self) -> Result<&str> {
        self.required_field_str(KIND, "Description")
    }

    /// The pool relative path of the `.deb`.
    pub fn filename(&self) -> Result<&str> {
        self.required_field_str(KIND, "Filename")
    }

    /// The size in bytes of the `.deb`.
    pub fn size(&self) -> Result<u64> {
        self.field_u64("Size")
            .ok_or(ArchiveError::ControlRequiredFieldMissing(KIND, "Size"))?
    }

    pub fn source(&self) -> Option<&str> {
        self.field_str("Source")
    }

    pub fn section(&self) -> Option<&str> {
        self.field_str("Section")
    }

    pub fn priority(&self) -> Option<&str> {
        self.field_str("Priority")
    }

    /// The name of the source package this binary was built from.
    ///
    /// `Source` may carry a version in parentheses (`foo (1.2-1)`), which is dropped.
    /// Without `Source`, the binary package name is the source name.
    pub fn source_name(&self) -> Result<&str> {
        match self.source() {
            Some(source) => Ok(source
                .split_once(' ')
                .map(|(name, _)| name)
                .unwrap_or(source)
                .trim()),
            None => self.package(),
        }
    }

    /// The declared digest of the `.deb` under an algorithm.
    pub fn digest(&self, algorithm: HashAlgorithm) -> Option<Result<FileHash>> {
        let hex = self.field_str(algorithm.package_field_name())?;

        Some(self.filename().and_then(|filename| {
            FileHash::from_hex(algorithm, hex.trim(), self.size()?, filename)
        }))
    }

    /// Point the entry at a pool file, recording its size and digests.
    pub fn set_file(&mut self, filename: &str, hashes: &[FileHash]) {
        self.set("Filename", filename);

        if let Some(first) = hashes.first() {
            self.set("Size", first.size.to_string());
        }

        for hash in hashes {
            self.set(hash.algorithm.package_field_name(), hash.digest_hex());
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::control::parse_paragraphs, indoc::indoc};

    const ENTRY: &str = indoc! {"
        Package: libzstd1
        Source: libzstd (1.4.8+dfsg-2.1)
        Version: 1.4.8+dfsg-2.1
        Architecture: amd64
        Maintainer: Debian Med Packaging Team <debian-med-packaging@lists.alioth.debian.org>
        Description: fast lossless compression algorithm
         Zstd, short for Zstandard, is a fast lossless compression algorithm.
        Filename: pool/main/libz/libzstd/libzstd1_1.4.8+dfsg-2.1_amd64.deb
        Size: 276392
        SHA256: 5dcadfbb743bfa1c1c773bff91c018f835e8e8c821d423d3836f3904e88e8c7e
    "};

    fn entry() -> Package {
        Package::from(parse_paragraphs(ENTRY).unwrap().remove(0))
    }

    #[test]
    fn accessors() -> Result<()> {
        let p = entry();
        p.validate()?;

        assert_eq!(p.package()?, "libzstd1");
        assert_eq!(p.source_name()?, "libzstd");
        assert_eq!(p.size()?, 276392);
        assert_eq!(p.version()?.upstream_version(), "1.4.8+dfsg");

        let digest = p.digest(HashAlgorithm::Sha256).unwrap()?;
        assert_eq!(digest.size, 276392);
        assert_eq!(digest.filename, p.filename()?);
        assert!(p.digest(HashAlgorithm::Sha512).is_none());

        Ok(())
    }

    #[test]
    fn validate_missing_field() {
        let mut p = entry();
        p.remove_field("Maintainer");

        assert!(matches!(
            p.validate(),
            Err(ArchiveError::ControlRequiredFieldMissing("Package", "Maintainer"))
        ));

        let mut p = entry();
        p.set("Size", "huge");
        assert!(p.validate().is_err());
    }

    #[test]
    fn set_file() -> Result<()> {
        let mut p = entry();
        p.remove_field("Source");
        p.remove_field("SHA256");

        let hash = FileHash::from_hex(
            HashAlgorithm::Md5,
            "d41d8cd98f00b204e9800998ecf8427e",
            42,
            "x",
        )?;
        p.set_file("pool/l/libzstd1/libzstd1_1.4.8+dfsg-2.1_amd64.deb", &[hash]);

        assert_eq!(p.size()?, 42);
        assert_eq!(
            p.field_str("MD5sum"),
            Some("d41d8cd98f00b204e9800998ecf8427e")
        );
        assert_eq!(p.source_name()?, "libzstd1");

        Ok(())
    }
}
