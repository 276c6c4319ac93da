// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Debian package version strings.

Versions have the form `[epoch:]upstream_version[-debian_revision]` and sort
according to <https://www.debian.org/doc/debian-policy/ch-controlfields.html#version>.
*/

use {
    std::{
        cmp::Ordering,
        fmt::{Display, Formatter},
        num::ParseIntError,
        str::FromStr,
    },
    thiserror::Error,
};

#[derive(Clone, Debug, Error)]
pub enum VersionError {
    #[error("error parsing string to integer: {0}")]
    ParseInt(#[from] ParseIntError),

    #[error("version string is empty")]
    Empty,

    #[error("the epoch component has non-digit characters: {0}")]
    EpochNonNumeric(String),

    #[error("upstream_version component has illegal character: {0}")]
    UpstreamVersionIllegalChar(String),

    #[error("debian_revision component has illegal character: {0}")]
    DebianRevisionIllegalChar(String),
}

pub type Result<T> = std::result::Result<T, VersionError>;

/// A parsed Debian package version.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PackageVersion {
    epoch: Option<u32>,
    upstream_version: String,
    debian_revision: Option<String>,
}

impl PackageVersion {
    /// Construct an instance by parsing a version string.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VersionError::Empty);
        }

        let (epoch, remainder) = match s.split_once(':') {
            Some((epoch, remainder)) => {
                if epoch.is_empty() || !epoch.bytes().all(|c| c.is_ascii_digit()) {
                    return Err(VersionError::EpochNonNumeric(s.to_string()));
                }

                (Some(u32::from_str(epoch)?), remainder)
            }
            None => (None, s),
        };

        // The revision follows the last hyphen. Without a revision, hyphens are illegal
        // in the upstream component, which the character check below enforces.
        let (upstream, revision) = match remainder.rsplit_once('-') {
            Some((upstream, revision)) => (upstream, Some(revision)),
            None => (remainder, None),
        };

        let upstream_ok = !upstream.is_empty()
            && upstream.chars().all(|c| {
                c.is_ascii_alphanumeric()
                    || matches!(c, '.' | '+' | '~')
                    || (c == '-' && revision.is_some())
                    || (c == ':' && epoch.is_some())
            });
        if !upstream_ok {
            return Err(VersionError::UpstreamVersionIllegalChar(s.to_string()));
        }

        if let Some(revision) = revision {
            if revision.is_empty()
                || !revision
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '~'))
            {
                return Err(VersionError::DebianRevisionIllegalChar(s.to_string()));
            }
        }

        Ok(Self {
            epoch,
            upstream_version: upstream.to_string(),
            debian_revision: revision.map(|r| r.to_string()),
        })
    }

    /// The explicit `epoch` component, if present.
    pub fn epoch(&self) -> Option<u32> {
        self.epoch
    }

    /// The `epoch` component, defaulting to `0`.
    pub fn epoch_assumed(&self) -> u32 {
        self.epoch.unwrap_or(0)
    }

    pub fn upstream_version(&self) -> &str {
        &self.upstream_version
    }

    pub fn debian_revision(&self) -> Option<&str> {
        self.debian_revision.as_deref()
    }
}

impl Display for PackageVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(epoch) = self.epoch {
            write!(f, "{}:", epoch)?;
        }

        f.write_str(&self.upstream_version)?;

        if let Some(revision) = &self.debian_revision {
            write!(f, "-{}", revision)?;
        }

        Ok(())
    }
}

impl FromStr for PackageVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Sort weight of a byte in the non-digit part of a component.
///
/// Tilde sorts before everything, even the end of the part. Letters sort before
/// all other non-digits.
fn char_order(c: Option<u8>) -> i32 {
    match c {
        None => 0,
        Some(b'~') => -1,
        Some(c) if c.is_ascii_digit() => 0,
        Some(c) if c.is_ascii_alphabetic() => c as i32,
        Some(c) => c as i32 + 256,
    }
}

fn compare_digits(a: &[u8], b: &[u8]) -> Ordering {
    let a = &a[a.iter().position(|c| *c != b'0').unwrap_or(a.len())..];
    let b = &b[b.iter().position(|c| *c != b'0').unwrap_or(b.len())..];

    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Compare an upstream or revision component.
fn compare_component(a: &str, b: &str) -> Ordering {
    let mut a = a.as_bytes();
    let mut b = b.as_bytes();

    while !a.is_empty() || !b.is_empty() {
        // Non-digit prefixes, compared with the modified lexical order.
        loop {
            let ac = a.first().copied().filter(|c| !c.is_ascii_digit());
            let bc = b.first().copied().filter(|c| !c.is_ascii_digit());

            if ac.is_none() && bc.is_none() {
                break;
            }

            match char_order(ac).cmp(&char_order(bc)) {
                Ordering::Equal => {}
                res => return res,
            }

            a = &a[1..];
            b = &b[1..];
        }

        // Digit runs, compared numerically. Empty counts as zero.
        let a_len = a.iter().take_while(|c| c.is_ascii_digit()).count();
        let b_len = b.iter().take_while(|c| c.is_ascii_digit()).count();

        match compare_digits(&a[0..a_len], &b[0..b_len]) {
            Ordering::Equal => {}
            res => return res,
        }

        a = &a[a_len..];
        b = &b[b_len..];
    }

    Ordering::Equal
}

impl PartialOrd<Self> for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // An absent revision is equivalent to `0`.
        self.epoch_assumed()
            .cmp(&other.epoch_assumed())
            .then_with(|| compare_component(&self.upstream_version, &other.upstream_version))
            .then_with(|| {
                compare_component(
                    self.debian_revision.as_deref().unwrap_or("0"),
                    other.debian_revision.as_deref().unwrap_or("0"),
                )
            })
    }
}
