//! SQLite-backed stores for identity, collaboration and public keys.
//!
//! The store creates its schema at open time. Mutators publish cascade
//! [`Invalidation`] events when a publisher is attached, so permission
//! caches converge without the callers having to remember which mutation
//! affects which key.
use std::collections::BTreeSet;
use std::path::Path;

use crossbeam_channel as chan;
use sqlite::{ConnectionThreadSafe, State};
use thiserror::Error;

use crate::access::{Invalidation, Membership, Provider, ProviderError, TeamGrant};
use crate::identity::{
    AccessMode, Org, OrgId, SubjectId, Team, TeamId, UnitPermissions, UnknownEnum, User, UserId,
    Unit, Visibility,
};
use crate::keys::{self, DeployBinding, DeployMode, KeyId, KeyType, StoredKey};
use crate::repo::{RepoId, Repository};

/// Store failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Sqlite(#[from] sqlite::Error),
    #[error(transparent)]
    UnknownEnum(#[from] UnknownEnum),
    #[error("key parse error: {0}")]
    Key(#[from] ssh_key::Error),
    #[error("a key with fingerprint {0} already exists")]
    KeyExists(String),
}

const SCHEMA: &str = "
  CREATE TABLE IF NOT EXISTS users (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    name           TEXT NOT NULL UNIQUE,
    active         INTEGER NOT NULL DEFAULT 1,
    deleted        INTEGER NOT NULL DEFAULT 0,
    admin          INTEGER NOT NULL DEFAULT 0,
    restricted     INTEGER NOT NULL DEFAULT 0,
    prohibit_login INTEGER NOT NULL DEFAULT 0
  );
  CREATE TABLE IF NOT EXISTS orgs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL UNIQUE,
    visibility      TEXT NOT NULL,
    base_permission TEXT NOT NULL DEFAULT 'none'
  );
  CREATE TABLE IF NOT EXISTS org_members (
    org      INTEGER NOT NULL REFERENCES orgs (id),
    user     INTEGER NOT NULL REFERENCES users (id),
    is_owner INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (org, user)
  );
  CREATE TABLE IF NOT EXISTS teams (
    id     INTEGER PRIMARY KEY AUTOINCREMENT,
    org    INTEGER NOT NULL REFERENCES orgs (id),
    parent INTEGER REFERENCES teams (id),
    name   TEXT NOT NULL,
    base   TEXT NOT NULL DEFAULT 'none',
    UNIQUE (org, name)
  );
  CREATE TABLE IF NOT EXISTS team_members (
    team INTEGER NOT NULL REFERENCES teams (id),
    user INTEGER NOT NULL REFERENCES users (id),
    PRIMARY KEY (team, user)
  );
  CREATE TABLE IF NOT EXISTS team_repos (
    team INTEGER NOT NULL REFERENCES teams (id),
    repo INTEGER NOT NULL REFERENCES repos (id),
    PRIMARY KEY (team, repo)
  );
  CREATE TABLE IF NOT EXISTS team_units (
    team INTEGER NOT NULL REFERENCES teams (id),
    unit TEXT NOT NULL,
    mode TEXT NOT NULL,
    PRIMARY KEY (team, unit)
  );
  CREATE TABLE IF NOT EXISTS repos (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_user INTEGER REFERENCES users (id),
    owner_org  INTEGER REFERENCES orgs (id),
    name       TEXT NOT NULL,
    visibility TEXT NOT NULL,
    archived   INTEGER NOT NULL DEFAULT 0,
    mirror     INTEGER NOT NULL DEFAULT 0,
    deleted    INTEGER NOT NULL DEFAULT 0,
    CHECK ((owner_user IS NULL) <> (owner_org IS NULL))
  );
  CREATE TABLE IF NOT EXISTS repo_units_disabled (
    repo INTEGER NOT NULL REFERENCES repos (id),
    unit TEXT NOT NULL,
    PRIMARY KEY (repo, unit)
  );
  CREATE TABLE IF NOT EXISTS collaborators (
    repo INTEGER NOT NULL REFERENCES repos (id),
    user INTEGER NOT NULL REFERENCES users (id),
    mode TEXT NOT NULL,
    PRIMARY KEY (repo, user)
  );
  CREATE TABLE IF NOT EXISTS public_keys (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    owner       INTEGER REFERENCES users (id),
    fingerprint TEXT NOT NULL UNIQUE,
    content     TEXT NOT NULL,
    type        TEXT NOT NULL,
    deploy_repo INTEGER REFERENCES repos (id),
    deploy_mode TEXT,
    last_used   INTEGER NOT NULL DEFAULT 0
  );
";

/// Identity, collaboration and key store.
pub struct Store {
    db: ConnectionThreadSafe,
    publisher: Option<chan::Sender<Invalidation>>,
}

impl Store {
    /// Open (and if necessary create) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let db = sqlite::Connection::open_thread_safe(path)?;
        db.execute("PRAGMA foreign_keys = ON")?;
        db.execute(SCHEMA)?;
        Ok(Self {
            db,
            publisher: None,
        })
    }

    /// In-memory store, mainly for tests.
    pub fn memory() -> Result<Self, Error> {
        Self::open(":memory:")
    }

    /// Attach a cascade-invalidation publisher; typically
    /// [`crate::access::Engine::publisher`].
    pub fn with_publisher(mut self, publisher: chan::Sender<Invalidation>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    fn publish(&self, event: Invalidation) {
        if let Some(publisher) = &self.publisher {
            publisher.send(event).ok();
        }
    }

    fn last_id(&self) -> Result<i64, Error> {
        let mut stmt = self.db.prepare("SELECT last_insert_rowid()")?;
        stmt.next()?;
        Ok(stmt.read::<i64, _>(0)?)
    }

    ////////////////////////////////////////////////////////////////////////
    // Users and organizations.
    ////////////////////////////////////////////////////////////////////////

    pub fn create_user(&self, name: &str) -> Result<UserId, Error> {
        let mut stmt = self.db.prepare("INSERT INTO users (name) VALUES (?)")?;
        stmt.bind((1, name))?;
        stmt.next()?;
        Ok(UserId(self.last_id()?))
    }

    pub fn user_by_name(&self, name: &str) -> Result<Option<User>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT id, name, active, deleted, admin, restricted, prohibit_login
             FROM users WHERE name = ?",
        )?;
        stmt.bind((1, name))?;
        if stmt.next()? == State::Row {
            Ok(Some(read_user(&stmt)?))
        } else {
            Ok(None)
        }
    }

    pub fn user(&self, id: UserId) -> Result<Option<User>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT id, name, active, deleted, admin, restricted, prohibit_login
             FROM users WHERE id = ?",
        )?;
        stmt.bind((1, id.0))?;
        if stmt.next()? == State::Row {
            Ok(Some(read_user(&stmt)?))
        } else {
            Ok(None)
        }
    }

    pub fn set_user_admin(&self, id: UserId, admin: bool) -> Result<(), Error> {
        self.set_user_flag(id, "admin", admin)
    }

    pub fn set_user_active(&self, id: UserId, active: bool) -> Result<(), Error> {
        self.set_user_flag(id, "active", active)
    }

    pub fn set_user_prohibit_login(&self, id: UserId, prohibit: bool) -> Result<(), Error> {
        self.set_user_flag(id, "prohibit_login", prohibit)
    }

    pub fn set_user_deleted(&self, id: UserId, deleted: bool) -> Result<(), Error> {
        self.set_user_flag(id, "deleted", deleted)
    }

    fn set_user_flag(&self, id: UserId, column: &str, value: bool) -> Result<(), Error> {
        let mut stmt = self
            .db
            .prepare(format!("UPDATE users SET {column} = ? WHERE id = ?"))?;
        stmt.bind((1, value as i64))?;
        stmt.bind((2, id.0))?;
        stmt.next()?;
        self.publish(Invalidation::UserFlags(id));
        Ok(())
    }

    pub fn create_org(&self, name: &str, visibility: Visibility) -> Result<OrgId, Error> {
        let mut stmt = self
            .db
            .prepare("INSERT INTO orgs (name, visibility) VALUES (?, ?)")?;
        stmt.bind((1, name))?;
        stmt.bind((2, visibility.to_string().as_str()))?;
        stmt.next()?;
        Ok(OrgId(self.last_id()?))
    }

    pub fn org(&self, id: OrgId) -> Result<Option<Org>, Error> {
        let mut stmt = self
            .db
            .prepare("SELECT id, name, visibility, base_permission FROM orgs WHERE id = ?")?;
        stmt.bind((1, id.0))?;
        if stmt.next()? == State::Row {
            Ok(Some(Org {
                id: OrgId(stmt.read::<i64, _>(0)?),
                name: stmt.read::<String, _>(1)?,
                visibility: stmt.read::<String, _>(2)?.parse()?,
                base_permission: stmt.read::<String, _>(3)?.parse()?,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn set_org_base_permission(&self, id: OrgId, mode: AccessMode) -> Result<(), Error> {
        let mut stmt = self
            .db
            .prepare("UPDATE orgs SET base_permission = ? WHERE id = ?")?;
        stmt.bind((1, mode.to_string().as_str()))?;
        stmt.bind((2, id.0))?;
        stmt.next()?;
        self.publish(Invalidation::OrgMembership(id));
        Ok(())
    }

    pub fn add_org_member(&self, org: OrgId, user: UserId, owner: bool) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "INSERT OR REPLACE INTO org_members (org, user, is_owner) VALUES (?, ?, ?)",
        )?;
        stmt.bind((1, org.0))?;
        stmt.bind((2, user.0))?;
        stmt.bind((3, owner as i64))?;
        stmt.next()?;
        self.publish(Invalidation::OrgMembership(org));
        Ok(())
    }

    pub fn remove_org_member(&self, org: OrgId, user: UserId) -> Result<(), Error> {
        let mut stmt = self
            .db
            .prepare("DELETE FROM org_members WHERE org = ? AND user = ?")?;
        stmt.bind((1, org.0))?;
        stmt.bind((2, user.0))?;
        stmt.next()?;
        self.publish(Invalidation::OrgMembership(org));
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Teams.
    ////////////////////////////////////////////////////////////////////////

    pub fn create_team(
        &self,
        org: OrgId,
        parent: Option<TeamId>,
        name: &str,
        base: AccessMode,
    ) -> Result<TeamId, Error> {
        let mut stmt = self
            .db
            .prepare("INSERT INTO teams (org, parent, name, base) VALUES (?, ?, ?, ?)")?;
        stmt.bind((1, org.0))?;
        stmt.bind((2, parent.map(|t| t.0)))?;
        stmt.bind((3, name))?;
        stmt.bind((4, base.to_string().as_str()))?;
        stmt.next()?;
        Ok(TeamId(self.last_id()?))
    }

    pub fn team(&self, id: TeamId) -> Result<Option<Team>, Error> {
        let mut stmt = self
            .db
            .prepare("SELECT id, org, parent, name, base FROM teams WHERE id = ?")?;
        stmt.bind((1, id.0))?;
        if stmt.next()? == State::Row {
            Ok(Some(Team {
                id: TeamId(stmt.read::<i64, _>(0)?),
                org: OrgId(stmt.read::<i64, _>(1)?),
                parent: stmt.read::<Option<i64>, _>(2)?.map(TeamId),
                name: stmt.read::<String, _>(3)?,
                base: stmt.read::<String, _>(4)?.parse()?,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn add_team_member(&self, team: TeamId, user: UserId) -> Result<(), Error> {
        let org = self.team_org(team)?;
        let mut stmt = self
            .db
            .prepare("INSERT OR REPLACE INTO team_members (team, user) VALUES (?, ?)")?;
        stmt.bind((1, team.0))?;
        stmt.bind((2, user.0))?;
        stmt.next()?;
        self.publish(Invalidation::TeamMembership(org));
        Ok(())
    }

    pub fn remove_team_member(&self, team: TeamId, user: UserId) -> Result<(), Error> {
        let org = self.team_org(team)?;
        let mut stmt = self
            .db
            .prepare("DELETE FROM team_members WHERE team = ? AND user = ?")?;
        stmt.bind((1, team.0))?;
        stmt.bind((2, user.0))?;
        stmt.next()?;
        self.publish(Invalidation::TeamMembership(org));
        Ok(())
    }

    pub fn add_team_repo(&self, team: TeamId, repo: RepoId) -> Result<(), Error> {
        let org = self.team_org(team)?;
        let mut stmt = self
            .db
            .prepare("INSERT OR REPLACE INTO team_repos (team, repo) VALUES (?, ?)")?;
        stmt.bind((1, team.0))?;
        stmt.bind((2, repo.0))?;
        stmt.next()?;
        self.publish(Invalidation::TeamRepos(org));
        Ok(())
    }

    pub fn remove_team_repo(&self, team: TeamId, repo: RepoId) -> Result<(), Error> {
        let org = self.team_org(team)?;
        let mut stmt = self
            .db
            .prepare("DELETE FROM team_repos WHERE team = ? AND repo = ?")?;
        stmt.bind((1, team.0))?;
        stmt.bind((2, repo.0))?;
        stmt.next()?;
        self.publish(Invalidation::TeamRepos(org));
        Ok(())
    }

    pub fn set_team_unit(&self, team: TeamId, unit: Unit, mode: AccessMode) -> Result<(), Error> {
        let org = self.team_org(team)?;
        let mut stmt = self
            .db
            .prepare("INSERT OR REPLACE INTO team_units (team, unit, mode) VALUES (?, ?, ?)")?;
        stmt.bind((1, team.0))?;
        stmt.bind((2, unit.as_str()))?;
        stmt.bind((3, mode.to_string().as_str()))?;
        stmt.next()?;
        self.publish(Invalidation::TeamRepos(org));
        Ok(())
    }

    fn team_org(&self, team: TeamId) -> Result<OrgId, Error> {
        let mut stmt = self.db.prepare("SELECT org FROM teams WHERE id = ?")?;
        stmt.bind((1, team.0))?;
        stmt.next()?;
        Ok(OrgId(stmt.read::<i64, _>(0)?))
    }

    ////////////////////////////////////////////////////////////////////////
    // Repositories and collaborators.
    ////////////////////////////////////////////////////////////////////////

    pub fn create_repo(
        &self,
        owner: SubjectId,
        name: &str,
        visibility: Visibility,
    ) -> Result<RepoId, Error> {
        let mut stmt = self.db.prepare(
            "INSERT INTO repos (owner_user, owner_org, name, visibility) VALUES (?, ?, ?, ?)",
        )?;
        stmt.bind((1, owner.user().map(|u| u.0)))?;
        stmt.bind((2, owner.org().map(|o| o.0)))?;
        stmt.bind((3, name))?;
        stmt.bind((4, visibility.to_string().as_str()))?;
        stmt.next()?;
        Ok(RepoId(self.last_id()?))
    }

    pub fn repository(&self, id: RepoId) -> Result<Option<Repository>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT id, owner_user, owner_org, name, visibility, archived, mirror, deleted
             FROM repos WHERE id = ?",
        )?;
        stmt.bind((1, id.0))?;
        if stmt.next()? != State::Row {
            return Ok(None);
        }
        let owner = match (
            stmt.read::<Option<i64>, _>(1)?,
            stmt.read::<Option<i64>, _>(2)?,
        ) {
            (Some(user), None) => SubjectId::User(UserId(user)),
            (None, Some(org)) => SubjectId::Org(OrgId(org)),
            // Unreachable per the table CHECK constraint.
            _ => return Ok(None),
        };
        let mut repo = Repository {
            id: RepoId(stmt.read::<i64, _>(0)?),
            owner,
            name: stmt.read::<String, _>(3)?,
            visibility: stmt.read::<String, _>(4)?.parse()?,
            archived: stmt.read::<i64, _>(5)? != 0,
            mirror: stmt.read::<i64, _>(6)? != 0,
            deleted: stmt.read::<i64, _>(7)? != 0,
            disabled_units: BTreeSet::new(),
        };

        let mut units = self
            .db
            .prepare("SELECT unit FROM repo_units_disabled WHERE repo = ?")?;
        units.bind((1, id.0))?;
        while units.next()? == State::Row {
            repo.disabled_units
                .insert(units.read::<String, _>(0)?.parse()?);
        }
        Ok(Some(repo))
    }

    pub fn repo_by_path(&self, owner: &str, name: &str) -> Result<Option<Repository>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT r.id FROM repos r
             LEFT JOIN users u ON u.id = r.owner_user
             LEFT JOIN orgs o ON o.id = r.owner_org
             WHERE r.name = ? AND r.deleted = 0
               AND (u.name = ? OR o.name = ?)",
        )?;
        stmt.bind((1, name))?;
        stmt.bind((2, owner))?;
        stmt.bind((3, owner))?;
        if stmt.next()? == State::Row {
            let id = RepoId(stmt.read::<i64, _>(0)?);
            self.repository(id)
        } else {
            Ok(None)
        }
    }

    pub fn set_repo_archived(&self, id: RepoId, archived: bool) -> Result<(), Error> {
        self.set_repo_flag(id, "archived", archived)
    }

    pub fn set_repo_mirror(&self, id: RepoId, mirror: bool) -> Result<(), Error> {
        self.set_repo_flag(id, "mirror", mirror)
    }

    pub fn set_repo_deleted(&self, id: RepoId, deleted: bool) -> Result<(), Error> {
        self.set_repo_flag(id, "deleted", deleted)
    }

    fn set_repo_flag(&self, id: RepoId, column: &str, value: bool) -> Result<(), Error> {
        let mut stmt = self
            .db
            .prepare(format!("UPDATE repos SET {column} = ? WHERE id = ?"))?;
        stmt.bind((1, value as i64))?;
        stmt.bind((2, id.0))?;
        stmt.next()?;
        self.publish(Invalidation::Repository(id));
        Ok(())
    }

    pub fn set_unit_disabled(&self, repo: RepoId, unit: Unit, disabled: bool) -> Result<(), Error> {
        let mut stmt = if disabled {
            let mut s = self
                .db
                .prepare("INSERT OR REPLACE INTO repo_units_disabled (repo, unit) VALUES (?, ?)")?;
            s.bind((1, repo.0))?;
            s.bind((2, unit.as_str()))?;
            s
        } else {
            let mut s = self
                .db
                .prepare("DELETE FROM repo_units_disabled WHERE repo = ? AND unit = ?")?;
            s.bind((1, repo.0))?;
            s.bind((2, unit.as_str()))?;
            s
        };
        stmt.next()?;
        self.publish(Invalidation::Repository(repo));
        Ok(())
    }

    pub fn add_collaborator(
        &self,
        repo: RepoId,
        user: UserId,
        mode: AccessMode,
    ) -> Result<(), Error> {
        let mut stmt = self
            .db
            .prepare("INSERT OR REPLACE INTO collaborators (repo, user, mode) VALUES (?, ?, ?)")?;
        stmt.bind((1, repo.0))?;
        stmt.bind((2, user.0))?;
        stmt.bind((3, mode.to_string().as_str()))?;
        stmt.next()?;
        self.publish(Invalidation::Collaborators(repo));
        Ok(())
    }

    pub fn remove_collaborator(&self, repo: RepoId, user: UserId) -> Result<(), Error> {
        let mut stmt = self
            .db
            .prepare("DELETE FROM collaborators WHERE repo = ? AND user = ?")?;
        stmt.bind((1, repo.0))?;
        stmt.bind((2, user.0))?;
        stmt.next()?;
        self.publish(Invalidation::Collaborators(repo));
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Public keys.
    ////////////////////////////////////////////////////////////////////////

    /// Store a user key given in OpenSSH format. Fails if the fingerprint
    /// is already present; fingerprints are unique service-wide.
    pub fn add_user_key(&self, owner: UserId, content: &str) -> Result<KeyId, Error> {
        let key = ssh_key::PublicKey::from_openssh(content)?;
        let fingerprint = keys::fingerprint(&key);
        self.insert_key(Some(owner), &fingerprint, content, KeyType::User, None)
    }

    /// Store a deploy key bound to a repository.
    pub fn add_deploy_key(
        &self,
        repo: RepoId,
        mode: DeployMode,
        content: &str,
    ) -> Result<KeyId, Error> {
        let key = ssh_key::PublicKey::from_openssh(content)?;
        let fingerprint = keys::fingerprint(&key);
        self.insert_key(
            None,
            &fingerprint,
            content,
            KeyType::Deploy,
            Some(DeployBinding { repo, mode }),
        )
    }

    /// Register a certificate principal for a user.
    pub fn add_principal(&self, owner: UserId, name: &str) -> Result<KeyId, Error> {
        let fingerprint = format!("principal:{name}");
        self.insert_key(Some(owner), &fingerprint, name, KeyType::Principal, None)
    }

    fn insert_key(
        &self,
        owner: Option<UserId>,
        fingerprint: &str,
        content: &str,
        key_type: KeyType,
        deploy: Option<DeployBinding>,
    ) -> Result<KeyId, Error> {
        if self.key_by_fingerprint(fingerprint)?.is_some() {
            return Err(Error::KeyExists(fingerprint.to_owned()));
        }
        let mut stmt = self.db.prepare(
            "INSERT INTO public_keys (owner, fingerprint, content, type, deploy_repo, deploy_mode)
             VALUES (?, ?, ?, ?, ?, ?)",
        )?;
        stmt.bind((1, owner.map(|u| u.0)))?;
        stmt.bind((2, fingerprint))?;
        stmt.bind((3, content))?;
        stmt.bind((4, key_type.to_string().as_str()))?;
        stmt.bind((5, deploy.map(|d| d.repo.0)))?;
        stmt.bind((6, deploy.map(|d| d.mode.to_string()).as_deref()))?;
        stmt.next()?;
        Ok(KeyId(self.last_id()?))
    }

    /// Primary key lookup path for SSH authentication.
    pub fn key_by_fingerprint(&self, fingerprint: &str) -> Result<Option<StoredKey>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT id, owner, fingerprint, content, type, deploy_repo, deploy_mode, last_used
             FROM public_keys WHERE fingerprint = ?",
        )?;
        stmt.bind((1, fingerprint))?;
        if stmt.next()? == State::Row {
            Ok(Some(read_key(&stmt)?))
        } else {
            Ok(None)
        }
    }

    /// Resolve a certificate principal to its key record.
    pub fn principal(&self, name: &str) -> Result<Option<StoredKey>, Error> {
        self.key_by_fingerprint(&format!("principal:{name}"))
    }

    /// Record a successful use of the key.
    pub fn touch_key(&self, id: KeyId, now: i64) -> Result<(), Error> {
        let mut stmt = self
            .db
            .prepare("UPDATE public_keys SET last_used = ? WHERE id = ?")?;
        stmt.bind((1, now))?;
        stmt.bind((2, id.0))?;
        stmt.next()?;
        Ok(())
    }
}

fn read_user(stmt: &sqlite::Statement<'_>) -> Result<User, Error> {
    Ok(User {
        id: UserId(stmt.read::<i64, _>(0)?),
        name: stmt.read::<String, _>(1)?,
        active: stmt.read::<i64, _>(2)? != 0,
        deleted: stmt.read::<i64, _>(3)? != 0,
        admin: stmt.read::<i64, _>(4)? != 0,
        restricted: stmt.read::<i64, _>(5)? != 0,
        prohibit_login: stmt.read::<i64, _>(6)? != 0,
    })
}

fn read_key(stmt: &sqlite::Statement<'_>) -> Result<StoredKey, Error> {
    let deploy_repo = stmt.read::<Option<i64>, _>(5)?;
    let deploy_mode = stmt.read::<Option<String>, _>(6)?;
    let deploy = match (deploy_repo, deploy_mode) {
        (Some(repo), Some(mode)) => Some(DeployBinding {
            repo: RepoId(repo),
            mode: mode.parse()?,
        }),
        _ => None,
    };
    Ok(StoredKey {
        id: KeyId(stmt.read::<i64, _>(0)?),
        owner: stmt.read::<Option<i64>, _>(1)?.map(UserId),
        fingerprint: stmt.read::<String, _>(2)?,
        content: stmt.read::<String, _>(3)?,
        key_type: stmt.read::<String, _>(4)?.parse()?,
        deploy,
        last_used: stmt.read::<i64, _>(7)?,
    })
}

impl Provider for Store {
    fn repository(&self, id: RepoId) -> Result<Option<Repository>, ProviderError> {
        Store::repository(self, id).map_err(ProviderError::new)
    }

    fn user(&self, id: UserId) -> Result<Option<User>, ProviderError> {
        Store::user(self, id).map_err(ProviderError::new)
    }

    fn org(&self, id: OrgId) -> Result<Option<Org>, ProviderError> {
        Store::org(self, id).map_err(ProviderError::new)
    }

    fn collaborator(&self, repo: RepoId, user: UserId) -> Result<Option<AccessMode>, ProviderError> {
        let run = || -> Result<Option<AccessMode>, Error> {
            let mut stmt = self
                .db
                .prepare("SELECT mode FROM collaborators WHERE repo = ? AND user = ?")?;
            stmt.bind((1, repo.0))?;
            stmt.bind((2, user.0))?;
            if stmt.next()? == State::Row {
                Ok(Some(stmt.read::<String, _>(0)?.parse()?))
            } else {
                Ok(None)
            }
        };
        run().map_err(ProviderError::new)
    }

    fn org_membership(&self, org: OrgId, user: UserId) -> Result<Option<Membership>, ProviderError> {
        let run = || -> Result<Option<Membership>, Error> {
            let mut stmt = self
                .db
                .prepare("SELECT is_owner FROM org_members WHERE org = ? AND user = ?")?;
            stmt.bind((1, org.0))?;
            stmt.bind((2, user.0))?;
            if stmt.next()? == State::Row {
                Ok(Some(Membership {
                    owner: stmt.read::<i64, _>(0)? != 0,
                }))
            } else {
                Ok(None)
            }
        };
        run().map_err(ProviderError::new)
    }

    fn team_grants(
        &self,
        org: OrgId,
        user: UserId,
        repo: RepoId,
    ) -> Result<Vec<TeamGrant>, ProviderError> {
        let run = || -> Result<Vec<TeamGrant>, Error> {
            let mut teams = self.db.prepare(
                "SELECT t.id, t.base FROM teams t
                 JOIN team_members tm ON tm.team = t.id
                 JOIN team_repos tr ON tr.team = t.id
                 WHERE t.org = ? AND tm.user = ? AND tr.repo = ?",
            )?;
            teams.bind((1, org.0))?;
            teams.bind((2, user.0))?;
            teams.bind((3, repo.0))?;

            let mut rows = Vec::new();
            while teams.next()? == State::Row {
                let id = TeamId(teams.read::<i64, _>(0)?);
                let base: AccessMode = teams.read::<String, _>(1)?.parse()?;
                rows.push((id, base));
            }

            let mut grants = Vec::with_capacity(rows.len());
            for (team, base) in rows {
                let mut units = UnitPermissions::new();
                let mut stmt = self
                    .db
                    .prepare("SELECT unit, mode FROM team_units WHERE team = ?")?;
                stmt.bind((1, team.0))?;
                while stmt.next()? == State::Row {
                    units.grant(
                        stmt.read::<String, _>(0)?.parse()?,
                        stmt.read::<String, _>(1)?.parse()?,
                    );
                }
                grants.push(TeamGrant { team, base, units });
            }
            Ok(grants)
        };
        run().map_err(ProviderError::new)
    }

    fn repositories(&self) -> Result<Vec<RepoId>, ProviderError> {
        let run = || -> Result<Vec<RepoId>, Error> {
            let mut stmt = self.db.prepare("SELECT id FROM repos WHERE deleted = 0")?;
            let mut out = Vec::new();
            while stmt.next()? == State::Row {
                out.push(RepoId(stmt.read::<i64, _>(0)?));
            }
            Ok(out)
        };
        run().map_err(ProviderError::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIIM1yzzJmnko19XpITUday/RmFUlVSNHcZDQVFyk9tv2 ci@plue";

    #[test]
    fn test_user_key_round_trip() {
        let store = Store::memory().unwrap();
        let alice = store.create_user("alice").unwrap();
        let id = store.add_user_key(alice, KEY).unwrap();

        let parsed = ssh_key::PublicKey::from_openssh(KEY).unwrap();
        let stored = store
            .key_by_fingerprint(&keys::fingerprint(&parsed))
            .unwrap()
            .expect("key is stored");
        assert_eq!(stored.id, id);
        assert_eq!(stored.owner, Some(alice));
        assert_eq!(stored.key_type, KeyType::User);
        assert_eq!(stored.deploy, None);
        assert_eq!(stored.last_used, 0);

        store.touch_key(id, 1_700_000_000).unwrap();
        let stored = store
            .key_by_fingerprint(&stored.fingerprint)
            .unwrap()
            .unwrap();
        assert_eq!(stored.last_used, 1_700_000_000);
    }

    #[test]
    fn test_duplicate_fingerprint_rejected() {
        let store = Store::memory().unwrap();
        let alice = store.create_user("alice").unwrap();
        let bob = store.create_user("bob").unwrap();
        store.add_user_key(alice, KEY).unwrap();
        assert!(matches!(
            store.add_user_key(bob, KEY),
            Err(Error::KeyExists(_))
        ));
    }

    #[test]
    fn test_deploy_key_binding() {
        let store = Store::memory().unwrap();
        let alice = store.create_user("alice").unwrap();
        let repo = store
            .create_repo(SubjectId::User(alice), "project", Visibility::Private)
            .unwrap();
        store.add_deploy_key(repo, DeployMode::Write, KEY).unwrap();

        let parsed = ssh_key::PublicKey::from_openssh(KEY).unwrap();
        let stored = store
            .key_by_fingerprint(&keys::fingerprint(&parsed))
            .unwrap()
            .unwrap();
        assert_eq!(stored.owner, None);
        assert_eq!(
            stored.deploy,
            Some(DeployBinding {
                repo,
                mode: DeployMode::Write
            })
        );
    }

    #[test]
    fn test_repo_by_path_resolves_org_and_user_owners() {
        let store = Store::memory().unwrap();
        let alice = store.create_user("alice").unwrap();
        let org = store.create_org("acme", Visibility::Public).unwrap();
        let personal = store
            .create_repo(SubjectId::User(alice), "dots", Visibility::Public)
            .unwrap();
        let shared = store
            .create_repo(SubjectId::Org(org), "infra", Visibility::Private)
            .unwrap();

        assert_eq!(
            store.repo_by_path("alice", "dots").unwrap().unwrap().id,
            personal
        );
        assert_eq!(
            store.repo_by_path("acme", "infra").unwrap().unwrap().id,
            shared
        );
        assert!(store.repo_by_path("alice", "infra").unwrap().is_none());
    }

    #[test]
    fn test_principal_lookup() {
        let store = Store::memory().unwrap();
        let alice = store.create_user("alice").unwrap();
        store.add_principal(alice, "alice@corp").unwrap();

        let stored = store.principal("alice@corp").unwrap().unwrap();
        assert_eq!(stored.owner, Some(alice));
        assert_eq!(stored.key_type, KeyType::Principal);
        assert!(store.principal("mallory@corp").unwrap().is_none());
    }
}
