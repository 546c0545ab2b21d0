//! SQLite metadata: sizes, tiers, reference counts, scan verdicts and
//! wrapped encryption keys.
//!
//! Deduplication is a ledger of `(oid, referrer)` pairs: a second `put` of
//! the same bytes by a new referrer adds a row instead of a write. When
//! the last reference goes, the object is stamped orphaned; physical
//! deletion happens in [`vacuum`](crate::Objects::vacuum) once the grace
//! window has passed.
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use sqlite::{ConnectionThreadSafe, State};
use thiserror::Error;

use plue::identity::{OrgId, UnknownEnum, UserId};
use plue::repo::RepoId;

use crate::oid::Oid;
use crate::tiered::Tier;

/// Who holds a reference to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Referrer {
    Repository(RepoId),
    User(UserId),
    Org(OrgId),
}

impl fmt::Display for Referrer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Repository(id) => write!(f, "repo:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
            Self::Org(id) => write!(f, "org:{id}"),
        }
    }
}

impl FromStr for Referrer {
    type Err = UnknownEnum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| v.parse::<i64>().map_err(|_| UnknownEnum::new("referrer", s));
        match s.split_once(':') {
            Some(("repo", id)) => Ok(Self::Repository(RepoId(parse(id)?))),
            Some(("user", id)) => Ok(Self::User(UserId(parse(id)?))),
            Some(("org", id)) => Ok(Self::Org(OrgId(parse(id)?))),
            _ => Err(UnknownEnum::new("referrer", s)),
        }
    }
}

/// Outcome of the external malware scanner.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ScanVerdict {
    #[default]
    Unscanned,
    Clean,
    Flagged,
}

impl ScanVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unscanned => "unscanned",
            Self::Clean => "clean",
            Self::Flagged => "flagged",
        }
    }
}

impl FromStr for ScanVerdict {
    type Err = UnknownEnum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unscanned" => Ok(Self::Unscanned),
            "clean" => Ok(Self::Clean),
            "flagged" => Ok(Self::Flagged),
            other => Err(UnknownEnum::new("scan verdict", other)),
        }
    }
}

/// Metadata of one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub oid: Oid,
    pub size: u64,
    pub tier: Tier,
    pub created_at: i64,
    pub last_accessed: i64,
    pub access_count: u64,
    /// Wrapped-data-key id, when stored encrypted.
    pub key_id: Option<i64>,
    pub verdict: ScanVerdict,
    /// Set when the last reference went away.
    pub orphaned_at: Option<i64>,
}

impl ObjectMeta {
    pub fn age_secs(&self, now: i64) -> i64 {
        now.saturating_sub(self.created_at)
    }

    pub fn idle_secs(&self, now: i64) -> i64 {
        now.saturating_sub(self.last_accessed)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Sqlite(#[from] sqlite::Error),
    #[error(transparent)]
    UnknownEnum(#[from] UnknownEnum),
    #[error("object {0} has no metadata")]
    Missing(Oid),
}

const SCHEMA: &str = "
  CREATE TABLE IF NOT EXISTS objects (
    oid           TEXT PRIMARY KEY,
    size          INTEGER NOT NULL,
    tier          TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    last_accessed INTEGER NOT NULL,
    access_count  INTEGER NOT NULL DEFAULT 0,
    key_id        INTEGER,
    verdict       TEXT NOT NULL DEFAULT 'unscanned',
    orphaned_at   INTEGER
  );
  CREATE TABLE IF NOT EXISTS refs (
    oid      TEXT NOT NULL REFERENCES objects (oid),
    referrer TEXT NOT NULL,
    PRIMARY KEY (oid, referrer)
  );
  CREATE TABLE IF NOT EXISTS data_keys (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    wrapped BLOB NOT NULL
  );
";

/// The metadata store.
pub struct Meta {
    db: ConnectionThreadSafe,
}

impl Meta {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let db = sqlite::Connection::open_thread_safe(path)?;
        db.execute("PRAGMA foreign_keys = ON")?;
        db.execute(SCHEMA)?;
        Ok(Self { db })
    }

    pub fn memory() -> Result<Self, Error> {
        Self::open(":memory:")
    }

    pub fn record_object(&self, oid: &Oid, size: u64, tier: Tier, now: i64) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "INSERT OR IGNORE INTO objects (oid, size, tier, created_at, last_accessed)
             VALUES (?, ?, ?, ?, ?)",
        )?;
        stmt.bind((1, oid.as_str()))?;
        stmt.bind((2, size as i64))?;
        stmt.bind((3, tier.as_str()))?;
        stmt.bind((4, now))?;
        stmt.bind((5, now))?;
        stmt.next()?;
        Ok(())
    }

    pub fn object(&self, oid: &Oid) -> Result<Option<ObjectMeta>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT oid, size, tier, created_at, last_accessed, access_count, key_id,
                    verdict, orphaned_at
             FROM objects WHERE oid = ?",
        )?;
        stmt.bind((1, oid.as_str()))?;
        if stmt.next()? == State::Row {
            Ok(Some(ObjectMeta {
                oid: stmt
                    .read::<String, _>(0)?
                    .parse()
                    .map_err(|_| Error::Missing(oid.clone()))?,
                size: stmt.read::<i64, _>(1)? as u64,
                tier: stmt.read::<String, _>(2)?.parse()?,
                created_at: stmt.read::<i64, _>(3)?,
                last_accessed: stmt.read::<i64, _>(4)?,
                access_count: stmt.read::<i64, _>(5)? as u64,
                key_id: stmt.read::<Option<i64>, _>(6)?,
                verdict: stmt.read::<String, _>(7)?.parse()?,
                orphaned_at: stmt.read::<Option<i64>, _>(8)?,
            }))
        } else {
            Ok(None)
        }
    }

    /// Bump access statistics on a read.
    pub fn touch(&self, oid: &Oid, now: i64) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "UPDATE objects SET last_accessed = ?, access_count = access_count + 1
             WHERE oid = ?",
        )?;
        stmt.bind((1, now))?;
        stmt.bind((2, oid.as_str()))?;
        stmt.next()?;
        Ok(())
    }

    /// Add a reference; returns whether the referrer is new. Any reference
    /// clears a pending orphan stamp.
    pub fn add_ref(&self, oid: &Oid, referrer: Referrer) -> Result<bool, Error> {
        let mut stmt = self
            .db
            .prepare("INSERT OR IGNORE INTO refs (oid, referrer) VALUES (?, ?)")?;
        stmt.bind((1, oid.as_str()))?;
        stmt.bind((2, referrer.to_string().as_str()))?;
        stmt.next()?;
        let added = self.changes()? > 0;

        let mut stmt = self
            .db
            .prepare("UPDATE objects SET orphaned_at = NULL WHERE oid = ?")?;
        stmt.bind((1, oid.as_str()))?;
        stmt.next()?;
        Ok(added)
    }

    /// Drop a reference; stamps the orphan time when it was the last one.
    /// Returns the remaining reference count.
    pub fn remove_ref(&self, oid: &Oid, referrer: Referrer, now: i64) -> Result<u64, Error> {
        let mut stmt = self
            .db
            .prepare("DELETE FROM refs WHERE oid = ? AND referrer = ?")?;
        stmt.bind((1, oid.as_str()))?;
        stmt.bind((2, referrer.to_string().as_str()))?;
        stmt.next()?;

        let remaining = self.ref_count(oid)?;
        if remaining == 0 {
            let mut stmt = self
                .db
                .prepare("UPDATE objects SET orphaned_at = ? WHERE oid = ? AND orphaned_at IS NULL")?;
            stmt.bind((1, now))?;
            stmt.bind((2, oid.as_str()))?;
            stmt.next()?;
        }
        Ok(remaining)
    }

    pub fn ref_count(&self, oid: &Oid) -> Result<u64, Error> {
        let mut stmt = self
            .db
            .prepare("SELECT COUNT(*) FROM refs WHERE oid = ?")?;
        stmt.bind((1, oid.as_str()))?;
        stmt.next()?;
        Ok(stmt.read::<i64, _>(0)? as u64)
    }

    /// Total stored bytes attributed to a referrer.
    pub fn usage(&self, referrer: Referrer) -> Result<u64, Error> {
        let mut stmt = self.db.prepare(
            "SELECT COALESCE(SUM(o.size), 0) FROM objects o
             JOIN refs r ON r.oid = o.oid WHERE r.referrer = ?",
        )?;
        stmt.bind((1, referrer.to_string().as_str()))?;
        stmt.next()?;
        Ok(stmt.read::<i64, _>(0)? as u64)
    }

    pub fn set_tier(&self, oid: &Oid, tier: Tier) -> Result<(), Error> {
        let mut stmt = self.db.prepare("UPDATE objects SET tier = ? WHERE oid = ?")?;
        stmt.bind((1, tier.as_str()))?;
        stmt.bind((2, oid.as_str()))?;
        stmt.next()?;
        Ok(())
    }

    pub fn set_verdict(&self, oid: &Oid, verdict: ScanVerdict) -> Result<(), Error> {
        let mut stmt = self
            .db
            .prepare("UPDATE objects SET verdict = ? WHERE oid = ?")?;
        stmt.bind((1, verdict.as_str()))?;
        stmt.bind((2, oid.as_str()))?;
        stmt.next()?;
        Ok(())
    }

    pub fn set_key_id(&self, oid: &Oid, key_id: i64) -> Result<(), Error> {
        let mut stmt = self
            .db
            .prepare("UPDATE objects SET key_id = ? WHERE oid = ?")?;
        stmt.bind((1, key_id))?;
        stmt.bind((2, oid.as_str()))?;
        stmt.next()?;
        Ok(())
    }

    /// Store a wrapped data key, returning its id.
    pub fn store_data_key(&self, wrapped: &[u8]) -> Result<i64, Error> {
        let mut stmt = self
            .db
            .prepare("INSERT INTO data_keys (wrapped) VALUES (?)")?;
        stmt.bind((1, wrapped))?;
        stmt.next()?;
        let mut stmt = self.db.prepare("SELECT last_insert_rowid()")?;
        stmt.next()?;
        Ok(stmt.read::<i64, _>(0)?)
    }

    pub fn data_key(&self, id: i64) -> Result<Option<Vec<u8>>, Error> {
        let mut stmt = self.db.prepare("SELECT wrapped FROM data_keys WHERE id = ?")?;
        stmt.bind((1, id))?;
        if stmt.next()? == State::Row {
            Ok(Some(stmt.read::<Vec<u8>, _>(0)?))
        } else {
            Ok(None)
        }
    }

    /// Objects whose last reference went away before `now - grace_secs`.
    pub fn orphans(&self, grace_secs: i64, now: i64) -> Result<Vec<Oid>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT oid FROM objects WHERE orphaned_at IS NOT NULL AND orphaned_at <= ?",
        )?;
        stmt.bind((1, now - grace_secs))?;
        let mut out = Vec::new();
        while stmt.next()? == State::Row {
            let oid: String = stmt.read(0)?;
            if let Ok(oid) = oid.parse() {
                out.push(oid);
            }
        }
        Ok(out)
    }

    /// Forget an object entirely after its physical removal.
    pub fn delete_object(&self, oid: &Oid) -> Result<(), Error> {
        let mut stmt = self.db.prepare("DELETE FROM refs WHERE oid = ?")?;
        stmt.bind((1, oid.as_str()))?;
        stmt.next()?;
        let mut stmt = self.db.prepare("DELETE FROM objects WHERE oid = ?")?;
        stmt.bind((1, oid.as_str()))?;
        stmt.next()?;
        Ok(())
    }

    /// A random sample of live objects for the corruption sweep.
    pub fn sample(&self, limit: usize) -> Result<Vec<Oid>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT oid FROM objects WHERE orphaned_at IS NULL ORDER BY RANDOM() LIMIT ?",
        )?;
        stmt.bind((1, limit as i64))?;
        let mut out = Vec::new();
        while stmt.next()? == State::Row {
            let oid: String = stmt.read(0)?;
            if let Ok(oid) = oid.parse() {
                out.push(oid);
            }
        }
        Ok(out)
    }

    /// Live object count.
    pub fn count(&self) -> Result<u64, Error> {
        let mut stmt = self
            .db
            .prepare("SELECT COUNT(*) FROM objects WHERE orphaned_at IS NULL")?;
        stmt.next()?;
        Ok(stmt.read::<i64, _>(0)? as u64)
    }

    fn changes(&self) -> Result<i64, Error> {
        let mut stmt = self.db.prepare("SELECT changes()")?;
        stmt.next()?;
        Ok(stmt.read::<i64, _>(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn oid(n: u8) -> Oid {
        Oid::of(&[n])
    }

    #[test]
    fn test_refcount_ledger() {
        let meta = Meta::memory().unwrap();
        let a = oid(1);
        meta.record_object(&a, 100, Tier::Hot, 10).unwrap();

        assert!(meta.add_ref(&a, Referrer::Repository(RepoId(1))).unwrap());
        // Same referrer again: not a new reference.
        assert!(!meta.add_ref(&a, Referrer::Repository(RepoId(1))).unwrap());
        assert!(meta.add_ref(&a, Referrer::User(UserId(7))).unwrap());
        assert_eq!(meta.ref_count(&a).unwrap(), 2);

        assert_eq!(
            meta.remove_ref(&a, Referrer::Repository(RepoId(1)), 20).unwrap(),
            1
        );
        assert_eq!(meta.object(&a).unwrap().unwrap().orphaned_at, None);

        assert_eq!(meta.remove_ref(&a, Referrer::User(UserId(7)), 30).unwrap(), 0);
        assert_eq!(meta.object(&a).unwrap().unwrap().orphaned_at, Some(30));

        // A new reference rescues the object.
        meta.add_ref(&a, Referrer::Org(OrgId(2))).unwrap();
        assert_eq!(meta.object(&a).unwrap().unwrap().orphaned_at, None);
    }

    #[test]
    fn test_orphans_respect_grace_window() {
        let meta = Meta::memory().unwrap();
        let a = oid(1);
        meta.record_object(&a, 100, Tier::Hot, 0).unwrap();
        meta.add_ref(&a, Referrer::User(UserId(1))).unwrap();
        meta.remove_ref(&a, Referrer::User(UserId(1)), 100).unwrap();

        assert!(meta.orphans(3600, 200).unwrap().is_empty());
        assert_eq!(meta.orphans(3600, 3700).unwrap(), vec![a]);
    }

    #[test]
    fn test_usage_per_referrer() {
        let meta = Meta::memory().unwrap();
        let a = oid(1);
        let b = oid(2);
        meta.record_object(&a, 100, Tier::Hot, 0).unwrap();
        meta.record_object(&b, 50, Tier::Hot, 0).unwrap();
        meta.add_ref(&a, Referrer::Repository(RepoId(1))).unwrap();
        meta.add_ref(&b, Referrer::Repository(RepoId(1))).unwrap();
        meta.add_ref(&b, Referrer::Repository(RepoId(2))).unwrap();

        assert_eq!(meta.usage(Referrer::Repository(RepoId(1))).unwrap(), 150);
        assert_eq!(meta.usage(Referrer::Repository(RepoId(2))).unwrap(), 50);
        assert_eq!(meta.usage(Referrer::Repository(RepoId(3))).unwrap(), 0);
    }

    #[test]
    fn test_touch_and_verdict() {
        let meta = Meta::memory().unwrap();
        let a = oid(1);
        meta.record_object(&a, 1, Tier::Hot, 0).unwrap();
        meta.touch(&a, 5).unwrap();
        meta.touch(&a, 9).unwrap();
        meta.set_verdict(&a, ScanVerdict::Clean).unwrap();

        let m = meta.object(&a).unwrap().unwrap();
        assert_eq!(m.access_count, 2);
        assert_eq!(m.last_accessed, 9);
        assert_eq!(m.verdict, ScanVerdict::Clean);
    }

    #[test]
    fn test_data_keys() {
        let meta = Meta::memory().unwrap();
        let id = meta.store_data_key(b"wrapped-key-bytes").unwrap();
        assert_eq!(meta.data_key(id).unwrap().unwrap(), b"wrapped-key-bytes");
        assert_eq!(meta.data_key(id + 1).unwrap(), None);
    }
}
