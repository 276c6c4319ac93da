// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Package relationships.

A relationship field such as `Build-Depends: libc6 (>= 2.4), foo | bar` is a comma
separated list of [Dependency], each an alternation of [Possibility] values. Only
the parts needed to match possibilities against known versions are modeled:
architecture restriction lists (`[amd64]`) and build profiles (`<!nocheck>`) are
accepted and discarded.
*/

use {
    crate::{
        error::{ArchiveError, Result},
        package_version::PackageVersion,
    },
    std::{
        cmp::Ordering,
        fmt::{Display, Formatter},
        str::FromStr,
    },
};

/// Version relation operator.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum VersionRelation {
    /// `<<`
    StrictlyEarlier,
    /// `<=`
    EarlierOrEqual,
    /// `=`
    ExactlyEqual,
    /// `>=`
    LaterOrEqual,
    /// `>>`
    StrictlyLater,
}

impl VersionRelation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StrictlyEarlier => "<<",
            Self::EarlierOrEqual => "<=",
            Self::ExactlyEqual => "=",
            Self::LaterOrEqual => ">=",
            Self::StrictlyLater => ">>",
        }
    }

    /// Whether a candidate comparing to the constraint version as `ordering` satisfies this.
    pub fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            Self::StrictlyEarlier => ordering == Ordering::Less,
            Self::EarlierOrEqual => ordering != Ordering::Greater,
            Self::ExactlyEqual => ordering == Ordering::Equal,
            Self::LaterOrEqual => ordering != Ordering::Less,
            Self::StrictlyLater => ordering == Ordering::Greater,
        }
    }
}

impl FromStr for VersionRelation {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "<<" => Ok(Self::StrictlyEarlier),
            // `<` and `>` are obsolete spellings of `<=` and `>=`.
            "<=" | "<" => Ok(Self::EarlierOrEqual),
            "=" => Ok(Self::ExactlyEqual),
            ">=" | ">" => Ok(Self::LaterOrEqual),
            ">>" => Ok(Self::StrictlyLater),
            _ => Err(ArchiveError::DependencyParse(format!(
                "unknown version relation: {}",
                s
            ))),
        }
    }
}

/// A `(relation version)` constraint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionConstraint {
    pub relation: VersionRelation,
    pub version: PackageVersion,
}

impl VersionConstraint {
    pub fn satisfied_by(&self, version: &PackageVersion) -> bool {
        self.relation.accepts(version.cmp(&self.version))
    }
}

impl Display for VersionConstraint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({} {})", self.relation.as_str(), self.version)
    }
}

/// A single candidate in a relationship, e.g. `libc6:amd64 (>= 2.4)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Possibility {
    pub package: String,
    pub architecture: Option<String>,
    pub constraint: Option<VersionConstraint>,
}

impl Possibility {
    /// Parse a single possibility.
    pub fn parse(s: &str) -> Result<Self> {
        let s = strip_restrictions(s);
        let s = s.trim();

        let (name_part, constraint) = match s.split_once('(') {
            Some((name, rest)) => {
                let inner = rest.strip_suffix(')').ok_or_else(|| {
                    ArchiveError::DependencyParse(format!("unterminated version constraint: {}", s))
                })?;

                (name.trim(), Some(parse_constraint(inner)?))
            }
            None => (s, None),
        };

        if name_part.is_empty() || name_part.contains(char::is_whitespace) {
            return Err(ArchiveError::DependencyParse(format!(
                "invalid package name in: {}",
                s
            )));
        }

        let (package, architecture) = match name_part.split_once(':') {
            Some((package, arch)) => (package, Some(arch.to_string())),
            None => (name_part, None),
        };

        Ok(Self {
            package: package.to_string(),
            architecture,
            constraint,
        })
    }

    /// Whether a version of the named package satisfies the constraint.
    ///
    /// A possibility without a constraint accepts any version.
    pub fn satisfied_by(&self, version: &PackageVersion) -> bool {
        self.constraint
            .as_ref()
            .map(|c| c.satisfied_by(version))
            .unwrap_or(true)
    }
}

impl FromStr for Possibility {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Display for Possibility {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.package)?;

        if let Some(arch) = &self.architecture {
            write!(f, ":{}", arch)?;
        }
        if let Some(constraint) = &self.constraint {
            write!(f, " {}", constraint)?;
        }

        Ok(())
    }
}

fn parse_constraint(s: &str) -> Result<VersionConstraint> {
    let s = s.trim();
    let split = s
        .find(|c: char| !matches!(c, '<' | '>' | '='))
        .unwrap_or(s.len());

    let (relation, version) = s.split_at(split);

    Ok(VersionConstraint {
        relation: VersionRelation::from_str(relation.trim())?,
        version: PackageVersion::parse(version)?,
    })
}

/// Remove `[...]` architecture lists and `<...>` build profile lists.
fn strip_restrictions(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth_square = 0usize;
    let mut depth_angle = 0usize;
    let mut in_parens = false;

    for c in s.chars() {
        match c {
            '(' => in_parens = true,
            ')' => in_parens = false,
            '[' if !in_parens => {
                depth_square += 1;
                continue;
            }
            ']' if !in_parens && depth_square > 0 => {
                depth_square -= 1;
                continue;
            }
            '<' if !in_parens && depth_square == 0 => {
                depth_angle += 1;
                continue;
            }
            '>' if !in_parens && depth_angle > 0 => {
                depth_angle -= 1;
                continue;
            }
            _ => {}
        }

        if depth_square == 0 && depth_angle == 0 {
            out.push(c);
        }
    }

    out
}

/// Alternative possibilities separated by `|`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Dependency {
    pub alternatives: Vec<Possibility>,
}

impl Display for Dependency {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let parts = self
            .alternatives
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>();

        f.write_str(&parts.join(" | "))
    }
}

/// A comma separated list of [Dependency].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DependencyList {
    pub dependencies: Vec<Dependency>,
}

impl DependencyList {
    pub fn parse(s: &str) -> Result<Self> {
        let dependencies = s
            .split(',')
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .map(|d| {
                Ok(Dependency {
                    alternatives: d
                        .split('|')
                        .map(Possibility::parse)
                        .collect::<Result<Vec<_>>>()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { dependencies })
    }

    /// Iterate over every possibility in every dependency.
    pub fn iter_possibilities(&self) -> impl Iterator<Item = &Possibility> {
        self.dependencies.iter().flat_map(|d| d.alternatives.iter())
    }
}

impl Display for DependencyList {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let parts = self
            .dependencies
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>();

        f.write_str(&parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_possibility() -> Result<()> {
        let p = Possibility::parse("libc6:amd64 (>= 2.4)")?;
        assert_eq!(p.package, "libc6");
        assert_eq!(p.architecture.as_deref(), Some("amd64"));
        let c = p.constraint.as_ref().unwrap();
        assert_eq!(c.relation, VersionRelation::LaterOrEqual);
        assert_eq!(c.version.to_string(), "2.4");
        assert_eq!(p.to_string(), "libc6:amd64 (>= 2.4)");

        let p = Possibility::parse("  foo  ")?;
        assert_eq!(p.package, "foo");
        assert!(p.constraint.is_none());

        let p = Possibility::parse("foo (<<1.0) [amd64 i386] <!nocheck>")?;
        assert_eq!(
            p.constraint.map(|c| c.relation),
            Some(VersionRelation::StrictlyEarlier)
        );

        assert!(Possibility::parse("foo (>= 1.0").is_err());
        assert!(Possibility::parse("foo (~= 1.0)").is_err());
        assert!(Possibility::parse("").is_err());

        Ok(())
    }

    #[test]
    fn satisfaction() -> Result<()> {
        let p = Possibility::parse("A (>= 1.5)")?;
        assert!(p.satisfied_by(&PackageVersion::parse("2.0")?));
        assert!(p.satisfied_by(&PackageVersion::parse("1.5")?));
        assert!(!p.satisfied_by(&PackageVersion::parse("1.0")?));

        let p = Possibility::parse("A (<< 1.5)")?;
        assert!(!p.satisfied_by(&PackageVersion::parse("1.5")?));
        assert!(p.satisfied_by(&PackageVersion::parse("1.5~rc1")?));

        assert!(Possibility::parse("A")?.satisfied_by(&PackageVersion::parse("0.1")?));

        Ok(())
    }

    #[test]
    fn parse_list() -> Result<()> {
        let list = DependencyList::parse(
            "debhelper-compat (= 13), libssl-dev | libssl1.0-dev, pkg-config [!hurd-any],",
        )?;
        assert_eq!(list.dependencies.len(), 3);
        assert_eq!(list.dependencies[1].alternatives.len(), 2);
        assert_eq!(list.iter_possibilities().count(), 4);
        assert_eq!(
            list.to_string(),
            "debhelper-compat (= 13), libssl-dev | libssl1.0-dev, pkg-config"
        );

        Ok(())
    }
}
