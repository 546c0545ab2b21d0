//! Permission resolution.
//!
//! Answers `is (subject, repo, unit, op) allowed?` by walking a fixed
//! priority ladder over data from a [`Provider`]. The first tier that grants
//! anything decides; within a tier the strongest mode per unit wins. Results
//! are memoized in a caller-provided [`RequestScope`].
pub mod cache;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use crossbeam_channel as chan;
use thiserror::Error;

use crate::identity::{AccessMode, Org, SubjectId, Unit, UnitPermissions, User, UserId};
use crate::repo::{RepoId, Repository};

pub use cache::{Invalidation, RequestScope};
use cache::InvalidationLog;

/// Who is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Actor {
    Anonymous,
    User(UserId),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => write!(f, "anonymous"),
            Self::User(id) => write!(f, "user/{id}"),
        }
    }
}

/// Requested operation on a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

impl Op {
    fn required_mode(&self) -> AccessMode {
        match self {
            Self::Read => AccessMode::Read,
            Self::Write => AccessMode::Write,
        }
    }
}

/// Which ladder tier decided a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Site administrator, non-restricted.
    Admin,
    /// The actor owns the repository.
    RepoOwner,
    /// Direct collaborator entry.
    Collaborator,
    /// Owner of the organization owning the repository.
    OrgOwner,
    /// One or more team grants.
    Team,
    /// Organization base permission.
    OrgMember,
    /// Repository visibility.
    Visibility,
    /// Nothing granted anything.
    None,
}

/// Outcome of a resolution: the per-unit mode map, the deciding tier, and
/// the repository flags needed for write gating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPermission {
    pub units: UnitPermissions,
    pub source: Source,
    pub archived: bool,
    pub mirror: bool,
}

impl ResolvedPermission {
    fn none(repo: &Repository) -> Self {
        Self {
            units: UnitPermissions::new(),
            source: Source::None,
            archived: repo.archived,
            mirror: repo.mirror,
        }
    }

    pub fn mode(&self, unit: Unit) -> AccessMode {
        self.units.get(unit)
    }

    /// Whether `op` on `unit` is allowed, applying the archived/mirror write
    /// gates for the code unit. The `source` tag is unaffected by gating.
    pub fn allows(&self, unit: Unit, op: Op) -> bool {
        if unit == Unit::Code && op == Op::Write && (self.archived || self.mirror) {
            return false;
        }
        self.mode(unit) >= op.required_mode()
    }
}

/// Membership of a user in an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub owner: bool,
}

/// What a single team grants a user on a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamGrant {
    pub team: crate::identity::TeamId,
    /// `Admin` grants admin on every unit regardless of `units`.
    pub base: AccessMode,
    pub units: UnitPermissions,
}

/// Opaque backend failure, reported by [`Provider`] implementations.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ProviderError(#[from] pub Box<dyn std::error::Error + Send + Sync + 'static>);

impl ProviderError {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Box::new(err))
    }
}

/// Read access to the persisted entities the ladder consults.
pub trait Provider {
    fn repository(&self, id: RepoId) -> Result<Option<Repository>, ProviderError>;
    fn user(&self, id: UserId) -> Result<Option<User>, ProviderError>;
    fn org(&self, id: crate::identity::OrgId) -> Result<Option<Org>, ProviderError>;
    /// Direct collaborator mode of `user` on `repo`, if any.
    fn collaborator(&self, repo: RepoId, user: UserId) -> Result<Option<AccessMode>, ProviderError>;
    fn org_membership(
        &self,
        org: crate::identity::OrgId,
        user: UserId,
    ) -> Result<Option<Membership>, ProviderError>;
    /// Grants from all teams of `org` that include `user` and list `repo`.
    fn team_grants(
        &self,
        org: crate::identity::OrgId,
        user: UserId,
        repo: RepoId,
    ) -> Result<Vec<TeamGrant>, ProviderError>;
    /// Ids of all live repositories, for reverse queries.
    fn repositories(&self) -> Result<Vec<RepoId>, ProviderError>;
}

/// Resolution failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("repository {0} not found")]
    NotFound(RepoId),
    /// The backend failed; the engine never answers "allowed" on error.
    #[error("permission backend error: {0}")]
    Backend(#[from] ProviderError),
}

/// The permission engine.
pub struct Engine<P> {
    provider: P,
    events: chan::Receiver<Invalidation>,
    publisher: chan::Sender<Invalidation>,
    log: Mutex<InvalidationLog>,
}

impl<P: Provider> Engine<P> {
    pub fn new(provider: P) -> Self {
        let (publisher, events) = chan::unbounded();
        Self {
            provider,
            events,
            publisher,
            log: Mutex::new(InvalidationLog::default()),
        }
    }

    /// Sender half for stores that mutate permission-relevant state.
    pub fn publisher(&self) -> chan::Sender<Invalidation> {
        self.publisher.clone()
    }

    /// Publish an invalidation directly.
    pub fn invalidate(&self, event: Invalidation) {
        // The receiver lives as long as the engine; this cannot fail.
        self.publisher.send(event).ok();
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Resolve the full unit→mode map for `actor` on `repo`.
    pub fn resolve(
        &self,
        scope: &mut RequestScope,
        actor: Actor,
        repo: RepoId,
    ) -> Result<ResolvedPermission, Error> {
        let mut log = self.log.lock().expect("access: invalidation log poisoned");
        for event in self.events.try_iter() {
            log.push(event);
        }
        if let Some(hit) = scope.lookup(&log, actor, repo) {
            log::trace!(target: "access", "Cache hit for {actor} on repo {repo}");
            return Ok(hit);
        }

        let repository = self
            .provider
            .repository(repo)?
            .filter(|r| !r.deleted)
            .ok_or(Error::NotFound(repo))?;
        let resolved = self.ladder(actor, &repository)?;
        log::debug!(
            target: "access",
            "Resolved {actor} on repo {repo}: {:?} via {:?}",
            resolved.units,
            resolved.source
        );
        scope.insert(&log, actor, repo, repository.owner, resolved.clone());
        Ok(resolved)
    }

    /// Convenience: is `op` on `unit` allowed?
    pub fn can(
        &self,
        scope: &mut RequestScope,
        actor: Actor,
        repo: RepoId,
        unit: Unit,
        op: Op,
    ) -> Result<bool, Error> {
        Ok(self.resolve(scope, actor, repo)?.allows(unit, op))
    }

    /// Batch resolution sharing the scope cache.
    pub fn bulk_resolve(
        &self,
        scope: &mut RequestScope,
        actor: Actor,
        repos: &[RepoId],
    ) -> Result<BTreeMap<RepoId, ResolvedPermission>, Error> {
        let mut out = BTreeMap::new();
        for &repo in repos {
            match self.resolve(scope, actor, repo) {
                Ok(resolved) => {
                    out.insert(repo, resolved);
                }
                Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    /// Repositories on which `actor` can read code; the forward rules
    /// applied in reverse.
    pub fn visible_repos(
        &self,
        scope: &mut RequestScope,
        actor: Actor,
    ) -> Result<Vec<RepoId>, Error> {
        let all = self.provider.repositories()?;
        let resolved = self.bulk_resolve(scope, actor, &all)?;
        Ok(resolved
            .into_iter()
            .filter(|(_, perm)| perm.allows(Unit::Code, Op::Read))
            .map(|(id, _)| id)
            .collect())
    }

    fn ladder(&self, actor: Actor, repo: &Repository) -> Result<ResolvedPermission, Error> {
        let finish = |units: UnitPermissions, source: Source| {
            let mut units = units;
            for unit in &repo.disabled_units {
                units.remove(*unit);
            }
            if units.is_empty() {
                None
            } else {
                Some(ResolvedPermission {
                    units,
                    source,
                    archived: repo.archived,
                    mirror: repo.mirror,
                })
            }
        };

        let uid = match actor {
            Actor::Anonymous => {
                // Tier 7 is the only one reachable anonymously.
                if repo.visibility == crate::identity::Visibility::Public {
                    let mut units = UnitPermissions::new();
                    units.grant(Unit::Code, AccessMode::Read);
                    if let Some(resolved) = finish(units, Source::Visibility) {
                        return Ok(resolved);
                    }
                }
                return Ok(ResolvedPermission::none(repo));
            }
            Actor::User(uid) => uid,
        };

        let Some(user) = self.provider.user(uid)?.filter(|u| !u.deleted) else {
            return Ok(ResolvedPermission::none(repo));
        };

        // 1. Site administrator.
        if user.is_effective_admin() {
            if let Some(r) = finish(UnitPermissions::uniform(AccessMode::Admin), Source::Admin) {
                return Ok(r);
            }
        }

        // 2. Repository owner.
        if repo.owner == SubjectId::User(uid) {
            if let Some(r) = finish(
                UnitPermissions::uniform(AccessMode::Admin),
                Source::RepoOwner,
            ) {
                return Ok(r);
            }
        }

        // 3. Direct collaborator.
        if let Some(mode) = self.provider.collaborator(repo.id, uid)? {
            if let Some(r) = finish(UnitPermissions::uniform(mode), Source::Collaborator) {
                return Ok(r);
            }
        }

        // 4–6. Organization tiers.
        let mut membership = None;
        if let SubjectId::Org(org) = repo.owner {
            membership = self.provider.org_membership(org, uid)?;

            if membership.map_or(false, |m| m.owner) {
                if let Some(r) = finish(
                    UnitPermissions::uniform(AccessMode::Admin),
                    Source::OrgOwner,
                ) {
                    return Ok(r);
                }
            }

            if membership.is_some() {
                let grants = self.provider.team_grants(org, uid, repo.id)?;
                if !grants.is_empty() {
                    let mut units = UnitPermissions::new();
                    for grant in &grants {
                        if grant.base == AccessMode::Admin {
                            units.merge(&UnitPermissions::uniform(AccessMode::Admin));
                        } else {
                            units.merge(&grant.units);
                        }
                    }
                    if let Some(r) = finish(units, Source::Team) {
                        return Ok(r);
                    }
                }

                let org_record = self
                    .provider
                    .org(org)?
                    .ok_or_else(|| Error::NotFound(repo.id))?;
                if !org_record.base_permission.is_none() {
                    if let Some(r) = finish(
                        UnitPermissions::uniform(org_record.base_permission),
                        Source::OrgMember,
                    ) {
                        return Ok(r);
                    }
                }
            }
        }

        // 7. Visibility.
        use crate::identity::Visibility;
        let visible = match repo.visibility {
            Visibility::Public => true,
            Visibility::Internal => !user.restricted,
            Visibility::Limited => membership.is_some(),
            Visibility::Private => false,
        };
        if visible {
            let mut units = UnitPermissions::new();
            units.grant(Unit::Code, AccessMode::Read);
            if let Some(r) = finish(units, Source::Visibility) {
                return Ok(r);
            }
        }

        Ok(ResolvedPermission::none(repo))
    }
}
