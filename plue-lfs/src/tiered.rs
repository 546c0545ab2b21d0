//! Storage tiers and the composite multi-tier backend.
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use plue::identity::UnknownEnum;

use crate::oid::Oid;
use crate::store::{Backend, ByteRange, Error, Upload};

/// Storage class by expected access frequency. Ordered hot → archival.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Hot,
    Warm,
    Cold,
    Archival,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Hot, Tier::Warm, Tier::Cold, Tier::Archival];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
            Self::Archival => "archival",
        }
    }
}

impl FromStr for Tier {
    type Err = UnknownEnum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hot" => Ok(Self::Hot),
            "warm" => Ok(Self::Warm),
            "cold" => Ok(Self::Cold),
            "archival" => Ok(Self::Archival),
            other => Err(UnknownEnum::new("tier", other)),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Proposes a target tier from an object's size and access history. All
/// thresholds are in seconds or bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Objects idle longer than this leave the hot tier.
    pub warm_after_idle: i64,
    pub cold_after_idle: i64,
    pub archive_after_idle: i64,
    /// Objects at least this large skip the hot tier from the start.
    pub large_object_bytes: u64,
    /// Frequently read objects stay hot regardless of age.
    pub hot_access_count: u64,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            warm_after_idle: 7 * 24 * 3600,
            cold_after_idle: 30 * 24 * 3600,
            archive_after_idle: 180 * 24 * 3600,
            large_object_bytes: 512 * 1024 * 1024,
            hot_access_count: 32,
        }
    }
}

impl TierPolicy {
    /// The tier this object ought to live in.
    pub fn target(&self, size: u64, idle_secs: i64, access_count: u64, age_secs: i64) -> Tier {
        if access_count >= self.hot_access_count && idle_secs < self.warm_after_idle {
            return Tier::Hot;
        }
        if idle_secs >= self.archive_after_idle {
            return Tier::Archival;
        }
        if idle_secs >= self.cold_after_idle {
            return Tier::Cold;
        }
        if idle_secs >= self.warm_after_idle || (size >= self.large_object_bytes && age_secs > 0) {
            return Tier::Warm;
        }
        Tier::Hot
    }
}

/// Composite backend with one store per tier. Writes land in the default
/// tier; reads search hot → archival; migration copies between tiers
/// out-of-band, never on the read path.
pub struct TieredBackend {
    tiers: BTreeMap<Tier, Box<dyn Backend>>,
    default_tier: Tier,
}

impl TieredBackend {
    pub fn new(tiers: BTreeMap<Tier, Box<dyn Backend>>, default_tier: Tier) -> Self {
        debug_assert!(tiers.contains_key(&default_tier));
        Self {
            tiers,
            default_tier,
        }
    }

    fn default_backend(&self) -> Result<&dyn Backend, Error> {
        self.tiers
            .get(&self.default_tier)
            .map(AsRef::as_ref)
            .ok_or_else(|| Error::BackendUnavailable("default tier is not configured".to_owned()))
    }

    fn locate(&self, oid: &Oid) -> Result<Option<(Tier, &dyn Backend)>, Error> {
        for (tier, backend) in &self.tiers {
            if backend.exists(oid)? {
                return Ok(Some((*tier, backend.as_ref())));
            }
        }
        Ok(None)
    }
}

impl Backend for TieredBackend {
    fn stream(
        &self,
        oid: &Oid,
        range: Option<ByteRange>,
    ) -> Result<Box<dyn Read + Send>, Error> {
        match self.locate(oid)? {
            Some((_, backend)) => backend.stream(oid, range),
            None => Err(Error::NotFound(oid.clone())),
        }
    }

    fn exists(&self, oid: &Oid) -> Result<bool, Error> {
        Ok(self.locate(oid)?.is_some())
    }

    fn remove(&self, oid: &Oid) -> Result<(), Error> {
        let mut found = false;
        for backend in self.tiers.values() {
            match backend.remove(oid) {
                Ok(()) => found = true,
                Err(Error::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        if found {
            Ok(())
        } else {
            Err(Error::NotFound(oid.clone()))
        }
    }

    fn upload(&self, oid: &Oid, declared_size: u64) -> Result<Box<dyn Upload>, Error> {
        self.default_backend()?.upload(oid, declared_size)
    }

    fn migrate(&self, oid: &Oid, target: Tier) -> Result<(), Error> {
        let Some((current, source)) = self.locate(oid)? else {
            return Err(Error::NotFound(oid.clone()));
        };
        if current == target {
            return Ok(());
        }
        let Some(destination) = self.tiers.get(&target) else {
            return Err(Error::BackendUnavailable(format!(
                "tier {target} is not configured"
            )));
        };

        let mut reader = source.stream(oid, None)?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        destination.put(oid, &bytes)?;
        source.remove(oid)?;
        log::debug!(target: "lfs", "Migrated {oid} from {current} to {target}");
        Ok(())
    }

    fn scavenge(&self, max_age_secs: u64) -> Result<usize, Error> {
        let mut total = 0;
        for backend in self.tiers.values() {
            total += backend.scavenge(max_age_secs)?;
        }
        Ok(total)
    }
}
