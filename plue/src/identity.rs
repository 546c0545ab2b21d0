//! Subjects, organizations, teams and feature units.
//!
//! Teams form a tree within an organization. The tree is represented as an
//! arena keyed by [`TeamId`]: a team refers to its parent and organization by
//! id only, never by an owning pointer.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// User identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Organization identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(pub i64);

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Team identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TeamId(pub i64);

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A subject that can own repositories: a user or an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectId {
    User(UserId),
    Org(OrgId),
}

impl SubjectId {
    pub fn user(&self) -> Option<UserId> {
        match self {
            Self::User(id) => Some(*id),
            Self::Org(_) => None,
        }
    }

    pub fn org(&self) -> Option<OrgId> {
        match self {
            Self::User(_) => None,
            Self::Org(id) => Some(*id),
        }
    }
}

impl From<UserId> for SubjectId {
    fn from(id: UserId) -> Self {
        Self::User(id)
    }
}

impl From<OrgId> for SubjectId {
    fn from(id: OrgId) -> Self {
        Self::Org(id)
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user/{id}"),
            Self::Org(id) => write!(f, "org/{id}"),
        }
    }
}

/// Repository and organization visibility.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Readable by anyone, including anonymous callers.
    Public,
    /// Readable by any authenticated subject.
    Internal,
    /// Readable by members of the owning organization.
    Limited,
    /// Readable only through explicit grants.
    #[default]
    Private,
}

impl FromStr for Visibility {
    type Err = UnknownEnum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "internal" => Ok(Self::Internal),
            "limited" => Ok(Self::Limited),
            "private" => Ok(Self::Private),
            other => Err(UnknownEnum::new("visibility", other)),
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Limited => "limited",
            Self::Private => "private",
        };
        write!(f, "{s}")
    }
}

/// A value that didn't match any variant of an enumerated column.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {what} {value:?}")]
pub struct UnknownEnum {
    pub what: &'static str,
    pub value: String,
}

impl UnknownEnum {
    pub fn new(what: &'static str, value: impl Into<String>) -> Self {
        Self {
            what,
            value: value.into(),
        }
    }
}

/// A user account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub active: bool,
    pub deleted: bool,
    pub admin: bool,
    /// Restricted users don't get implicit read access and never count as
    /// administrators for permission resolution.
    pub restricted: bool,
    pub prohibit_login: bool,
}

impl User {
    /// Whether this account may authenticate at all.
    pub fn can_authenticate(&self) -> bool {
        self.active && !self.deleted && !self.prohibit_login
    }

    /// Whether this account resolves as a site administrator.
    pub fn is_effective_admin(&self) -> bool {
        self.admin && !self.restricted
    }
}

/// An organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Org {
    pub id: OrgId,
    pub name: String,
    pub visibility: Visibility,
    /// Access granted to plain members that aren't covered by any team.
    pub base_permission: AccessMode,
}

/// A team within an organization. Parent/organization are back-references by
/// id; the containing arena owns all teams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team {
    pub id: TeamId,
    pub org: OrgId,
    pub parent: Option<TeamId>,
    pub name: String,
    /// Applied to every unit when no per-unit permission is configured.
    /// `Admin` teams always grant admin on all units.
    pub base: AccessMode,
}

/// Feature area of a repository with independent access control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Code,
    Issues,
    PullRequests,
    Releases,
    Wiki,
    Packages,
    Actions,
    Projects,
}

impl Unit {
    pub const ALL: [Unit; 8] = [
        Unit::Code,
        Unit::Issues,
        Unit::PullRequests,
        Unit::Releases,
        Unit::Wiki,
        Unit::Packages,
        Unit::Actions,
        Unit::Projects,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Issues => "issues",
            Self::PullRequests => "pull_requests",
            Self::Releases => "releases",
            Self::Wiki => "wiki",
            Self::Packages => "packages",
            Self::Actions => "actions",
            Self::Projects => "projects",
        }
    }
}

impl FromStr for Unit {
    type Err = UnknownEnum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(Self::Code),
            "issues" => Ok(Self::Issues),
            "pull_requests" => Ok(Self::PullRequests),
            "releases" => Ok(Self::Releases),
            "wiki" => Ok(Self::Wiki),
            "packages" => Ok(Self::Packages),
            "actions" => Ok(Self::Actions),
            "projects" => Ok(Self::Projects),
            other => Err(UnknownEnum::new("unit", other)),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Access mode granted on a unit. Ordered from weakest to strongest.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    None,
    Read,
    Write,
    Admin,
}

impl AccessMode {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl FromStr for AccessMode {
    type Err = UnknownEnum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "admin" => Ok(Self::Admin),
            other => Err(UnknownEnum::new("access mode", other)),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        };
        write!(f, "{s}")
    }
}

/// Per-unit access modes. Units absent from the map resolve to
/// [`AccessMode::None`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnitPermissions {
    modes: BTreeMap<Unit, AccessMode>,
}

impl UnitPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// All units at the given mode.
    pub fn uniform(mode: AccessMode) -> Self {
        let mut this = Self::new();
        if !mode.is_none() {
            for unit in Unit::ALL {
                this.modes.insert(unit, mode);
            }
        }
        this
    }

    pub fn get(&self, unit: Unit) -> AccessMode {
        self.modes.get(&unit).copied().unwrap_or_default()
    }

    /// Raise the mode of `unit` to `mode` if it is stronger than the current
    /// one.
    pub fn grant(&mut self, unit: Unit, mode: AccessMode) {
        if mode.is_none() {
            return;
        }
        let entry = self.modes.entry(unit).or_default();
        if mode > *entry {
            *entry = mode;
        }
    }

    /// Union with another permission set; the strongest mode wins per unit.
    pub fn merge(&mut self, other: &UnitPermissions) {
        for (unit, mode) in &other.modes {
            self.grant(*unit, *mode);
        }
    }

    /// Drop the given unit entirely.
    pub fn remove(&mut self, unit: Unit) {
        self.modes.remove(&unit);
    }

    pub fn is_empty(&self) -> bool {
        self.modes.values().all(|m| m.is_none())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Unit, AccessMode)> + '_ {
        self.modes.iter().map(|(u, m)| (*u, *m))
    }
}

impl FromIterator<(Unit, AccessMode)> for UnitPermissions {
    fn from_iter<I: IntoIterator<Item = (Unit, AccessMode)>>(iter: I) -> Self {
        let mut this = Self::new();
        for (unit, mode) in iter {
            this.grant(unit, mode);
        }
        this
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_access_mode_ordering() {
        assert!(AccessMode::None < AccessMode::Read);
        assert!(AccessMode::Read < AccessMode::Write);
        assert!(AccessMode::Write < AccessMode::Admin);
    }

    #[test]
    fn test_unit_permissions_merge_takes_strongest() {
        let mut a: UnitPermissions = [(Unit::Code, AccessMode::Read)].into_iter().collect();
        let b: UnitPermissions = [
            (Unit::Code, AccessMode::Write),
            (Unit::Issues, AccessMode::Read),
        ]
        .into_iter()
        .collect();

        a.merge(&b);
        assert_eq!(a.get(Unit::Code), AccessMode::Write);
        assert_eq!(a.get(Unit::Issues), AccessMode::Read);
        assert_eq!(a.get(Unit::Wiki), AccessMode::None);
    }

    #[test]
    fn test_unit_permissions_grant_never_downgrades() {
        let mut perms = UnitPermissions::uniform(AccessMode::Admin);
        perms.grant(Unit::Code, AccessMode::Read);
        assert_eq!(perms.get(Unit::Code), AccessMode::Admin);
    }

    #[test]
    fn test_enum_round_trips() {
        for unit in Unit::ALL {
            assert_eq!(unit.as_str().parse::<Unit>().unwrap(), unit);
        }
        for mode in ["none", "read", "write", "admin"] {
            assert_eq!(mode.parse::<AccessMode>().unwrap().to_string(), mode);
        }
        assert!("owner".parse::<AccessMode>().is_err());
    }

    #[test]
    fn test_restricted_admin_is_not_effective() {
        let user = User {
            id: UserId(1),
            name: "ops".into(),
            active: true,
            deleted: false,
            admin: true,
            restricted: true,
            prohibit_login: false,
        };
        assert!(!user.is_effective_admin());
        assert!(user.can_authenticate());
    }
}
