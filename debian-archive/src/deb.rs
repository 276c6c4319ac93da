// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Reading `.deb` binary package files.

A `.deb` is an `ar` archive holding `debian-binary`, a `control.tar` and a
`data.tar`. The tarballs may be compressed. Only the `control` file inside
`control.tar` is of interest here.
*/

use {
    crate::{
        control::{parse_paragraphs, ControlParagraph},
        error::{ArchiveError, Result},
        io::Compression,
    },
    std::{
        io::Read,
        path::{Path, PathBuf},
    },
};

fn decompressing_reader<'a>(
    reader: impl Read + 'a,
    compression: Compression,
) -> Result<Box<dyn Read + 'a>> {
    match compression {
        Compression::None => Ok(Box::new(reader)),
        Compression::Gzip => Ok(Box::new(libflate::gzip::Decoder::new(reader)?)),
        Compression::Xz => Ok(Box::new(xz2::read::XzDecoder::new(reader))),
        Compression::Zstd => Ok(Box::new(zstd::Decoder::new(reader)?)),
        c => Err(ArchiveError::DebUnknownCompression(format!("{}", c))),
    }
}

/// Extract the control paragraph from `.deb` content.
pub fn read_control<R: Read>(reader: R) -> Result<ControlParagraph> {
    let mut archive = ar::Archive::new(reader);

    while let Some(entry) = archive.next_entry() {
        let entry = entry?;
        let identifier = String::from_utf8_lossy(entry.header().identifier()).to_string();

        if identifier == "debian-binary" || identifier.starts_with("data.tar") {
            continue;
        }

        let suffix = identifier
            .strip_prefix("control.tar")
            .ok_or_else(|| ArchiveError::DebUnknownBinaryPackageEntry(identifier.clone()))?;

        let compression = match suffix {
            "" => Compression::None,
            ".gz" => Compression::Gzip,
            ".xz" => Compression::Xz,
            ".zst" => Compression::Zstd,
            _ => return Err(ArchiveError::DebUnknownCompression(identifier)),
        };

        let mut tar = tar::Archive::new(decompressing_reader(entry, compression)?);

        for file in tar.entries()? {
            let mut file = file?;
            let path = file.path()?.to_path_buf();

            if path == Path::new("./control") || path == Path::new("control") {
                let mut data = String::new();
                file.read_to_string(&mut data)?;

                return parse_paragraphs(&data)?
                    .into_iter()
                    .next()
                    .ok_or(ArchiveError::DebControlFileNotFound);
            }
        }

        return Err(ArchiveError::DebControlFileNotFound);
    }

    Err(ArchiveError::DebControlFileNotFound)
}

/// A `.deb` file on disk and its control paragraph.
#[derive(Clone, Debug)]
pub struct DebFile {
    pub path: PathBuf,
    pub control: ControlParagraph,
}

impl DebFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let fh = std::fs::File::open(&path)
            .map_err(|e| ArchiveError::IoPath(format!("{}", path.display()), e))?;

        let control = read_control(std::io::BufReader::new(fh))?;

        Ok(Self { path, control })
    }
}
