//! Memory spaces – the access scopes everything in FamilyOS is keyed by.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::envelope::EnvelopeError;

/// The relationship class of a memory space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceKind {
    /// Single family member only.
    Personal,
    /// Explicitly enumerated members.
    Selective,
    /// The whole household.
    Shared,
    /// Extended family.
    Extended,
    /// Across befriended families.
    Interfamily,
}

impl SpaceKind {
    /// Stable lowercase name used in the `{kind}:{name}` wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceKind::Personal => "personal",
            SpaceKind::Selective => "selective",
            SpaceKind::Shared => "shared",
            SpaceKind::Extended => "extended",
            SpaceKind::Interfamily => "interfamily",
        }
    }
}

impl FromStr for SpaceKind {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "personal" => Ok(SpaceKind::Personal),
            "selective" => Ok(SpaceKind::Selective),
            "shared" => Ok(SpaceKind::Shared),
            "extended" => Ok(SpaceKind::Extended),
            "interfamily" => Ok(SpaceKind::Interfamily),
            other => Err(EnvelopeError::InvalidSpace(other.to_string())),
        }
    }
}

/// A logical memory scope, wire form `{kind}:{name}` (e.g. `shared:household`).
///
/// Spaces partition every store in the system: WALs fan out per space, the
/// hippocampal index never matches across spaces, and replication keys are
/// scoped to a single space.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpaceId {
    /// Relationship class.
    pub kind: SpaceKind,
    /// Space name, non-empty, no `:` allowed.
    pub name: String,
}

impl SpaceId {
    /// Construct a space id, validating the name.
    pub fn new(kind: SpaceKind, name: impl Into<String>) -> Result<Self, EnvelopeError> {
        let name = name.into();
        if name.is_empty() || name.contains(':') {
            return Err(EnvelopeError::InvalidSpace(name));
        }
        Ok(Self { kind, name })
    }

    /// Parse the `{kind}:{name}` wire form.
    pub fn parse(s: &str) -> Result<Self, EnvelopeError> {
        let (kind, name) = s
            .split_once(':')
            .ok_or_else(|| EnvelopeError::InvalidSpace(s.to_string()))?;
        Self::new(kind.parse::<SpaceKind>()?, name)
    }

    /// Filesystem-safe rendition (`shared__household`).
    pub fn dir_name(&self) -> String {
        format!("{}__{}", self.kind.as_str(), self.name)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.name)
    }
}

impl TryFrom<String> for SpaceId {
    type Error = EnvelopeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        SpaceId::parse(&s)
    }
}

impl From<SpaceId> for String {
    fn from(s: SpaceId) -> String {
        s.to_string()
    }
}
