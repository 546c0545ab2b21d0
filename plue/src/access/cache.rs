//! Request-scoped permission cache and cascade invalidation.
//!
//! A [`RequestScope`] lives for the duration of one external request and
//! memoizes resolved permissions. Mutations elsewhere in the service publish
//! [`Invalidation`] events; the engine stamps every cache entry with an epoch
//! and purges entries a later event matches, on the next read. Scopes are
//! short-lived, so no TTL is needed.
use std::collections::{HashMap, VecDeque};

use crate::identity::{OrgId, SubjectId, UserId};
use crate::repo::RepoId;

use super::{Actor, ResolvedPermission};

/// Bound on the shared invalidation log. Entries older than the window are
/// pruned; cache entries stamped before the oldest retained epoch are
/// purged unconditionally.
const LOG_WINDOW: usize = 1024;

/// A mutation that may change resolved permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// Repository flags, visibility or unit toggles changed.
    Repository(RepoId),
    /// The collaborator set of a repository changed.
    Collaborators(RepoId),
    /// Team membership changed somewhere in the organization.
    TeamMembership(OrgId),
    /// A team-repository assignment changed in the organization.
    TeamRepos(OrgId),
    /// Organization membership changed.
    OrgMembership(OrgId),
    /// User flags changed.
    UserFlags(UserId),
}

impl Invalidation {
    /// Whether this event may affect the cache entry described by the key.
    fn matches(&self, key: &CacheKey) -> bool {
        match self {
            Self::Repository(rid) | Self::Collaborators(rid) => *rid == key.repo,
            Self::TeamMembership(org) | Self::TeamRepos(org) | Self::OrgMembership(org) => {
                key.owner == SubjectId::Org(*org)
            }
            Self::UserFlags(uid) => key.actor == Actor::User(*uid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    actor: Actor,
    repo: RepoId,
    /// Owner of the repository at resolution time, needed to match
    /// organization-scoped events.
    owner: SubjectId,
}

/// Shared, epoch-stamped log of recent invalidations.
#[derive(Debug, Default)]
pub(super) struct InvalidationLog {
    epoch: u64,
    entries: VecDeque<(u64, Invalidation)>,
}

impl InvalidationLog {
    pub fn push(&mut self, event: Invalidation) {
        self.epoch += 1;
        self.entries.push_back((self.epoch, event));
        while self.entries.len() > LOG_WINDOW {
            self.entries.pop_front();
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether an event later than `since` matches the key, or the log has
    /// been pruned past `since` (in which case we can't tell and say yes).
    fn invalidated_since(&self, since: u64, key: &CacheKey) -> bool {
        if let Some((oldest, _)) = self.entries.front() {
            if since + 1 < *oldest {
                return true;
            }
        } else if since < self.epoch {
            return true;
        }
        self.entries
            .iter()
            .any(|(epoch, event)| *epoch > since && event.matches(key))
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    permission: ResolvedPermission,
    epoch: u64,
}

/// Per-request permission cache. Create one per external request and drop it
/// when the request completes.
#[derive(Debug, Default)]
pub struct RequestScope {
    entries: HashMap<CacheKey, CacheEntry>,
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn lookup(
        &mut self,
        log: &InvalidationLog,
        actor: Actor,
        repo: RepoId,
    ) -> Option<ResolvedPermission> {
        // Owner is part of the key but unknown before the first resolution;
        // scan for the (actor, repo) pair instead of hashing.
        let (key, entry) = self
            .entries
            .iter()
            .find(|(k, _)| k.actor == actor && k.repo == repo)
            .map(|(k, e)| (*k, e.clone()))?;

        if log.invalidated_since(entry.epoch, &key) {
            self.entries.remove(&key);
            return None;
        }
        Some(entry.permission)
    }

    pub(super) fn insert(
        &mut self,
        log: &InvalidationLog,
        actor: Actor,
        repo: RepoId,
        owner: SubjectId,
        permission: ResolvedPermission,
    ) {
        self.entries.insert(
            CacheKey { actor, repo, owner },
            CacheEntry {
                permission,
                epoch: log.epoch(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Source;
    use crate::identity::{AccessMode, UnitPermissions};

    fn perm() -> ResolvedPermission {
        ResolvedPermission {
            units: UnitPermissions::uniform(AccessMode::Read),
            source: Source::Visibility,
            archived: false,
            mirror: false,
        }
    }

    #[test]
    fn test_hit_until_matching_invalidation() {
        let mut log = InvalidationLog::default();
        let mut scope = RequestScope::new();
        let actor = Actor::User(UserId(7));
        let repo = RepoId(1);
        let owner = SubjectId::Org(OrgId(3));

        scope.insert(&log, actor, repo, owner, perm());
        assert!(scope.lookup(&log, actor, repo).is_some());

        // Unrelated event: still a hit.
        log.push(Invalidation::Collaborators(RepoId(99)));
        assert!(scope.lookup(&log, actor, repo).is_some());

        // Org-scoped event for the owning org: purged.
        log.push(Invalidation::TeamMembership(OrgId(3)));
        assert!(scope.lookup(&log, actor, repo).is_none());
        assert!(scope.is_empty());
    }

    #[test]
    fn test_user_flag_event_purges_only_that_actor() {
        let mut log = InvalidationLog::default();
        let mut scope = RequestScope::new();
        let owner = SubjectId::User(UserId(1));

        scope.insert(&log, Actor::User(UserId(7)), RepoId(1), owner, perm());
        scope.insert(&log, Actor::User(UserId(8)), RepoId(1), owner, perm());

        log.push(Invalidation::UserFlags(UserId(7)));
        assert!(scope.lookup(&log, Actor::User(UserId(7)), RepoId(1)).is_none());
        assert!(scope.lookup(&log, Actor::User(UserId(8)), RepoId(1)).is_some());
    }

    #[test]
    fn test_pruned_log_is_conservative() {
        let mut log = InvalidationLog::default();
        let mut scope = RequestScope::new();
        let actor = Actor::Anonymous;
        let repo = RepoId(1);

        scope.insert(&log, actor, repo, SubjectId::User(UserId(1)), perm());
        for i in 0..(LOG_WINDOW as i64 + 10) {
            log.push(Invalidation::Collaborators(RepoId(1000 + i)));
        }
        // The entry's epoch fell off the log; assume the worst.
        assert!(scope.lookup(&log, actor, repo).is_none());
    }
}
