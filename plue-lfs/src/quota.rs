//! Storage quotas.
//!
//! Limits apply per user, per organization and per repository; a write is
//! checked against every referrer it would be attributed to, and the first
//! limit that would be crossed rejects it before anything is committed.
use serde::Deserialize;

use crate::meta::{Meta, Referrer};
use crate::store::Error;

/// Byte limits; `None` means unlimited.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuotaConfig {
    pub per_user: Option<u64>,
    pub per_org: Option<u64>,
    pub per_repo: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct QuotaManager {
    config: QuotaConfig,
}

impl QuotaManager {
    pub fn new(config: QuotaConfig) -> Self {
        Self { config }
    }

    /// Check whether `incoming` additional bytes fit every referrer's
    /// limit.
    pub fn check(&self, meta: &Meta, referrers: &[Referrer], incoming: u64) -> Result<(), Error> {
        for referrer in referrers {
            let (scope, limit) = match referrer {
                Referrer::User(_) => ("user", self.config.per_user),
                Referrer::Org(_) => ("organization", self.config.per_org),
                Referrer::Repository(_) => ("repository", self.config.per_repo),
            };
            let Some(limit) = limit else { continue };
            let used = meta.usage(*referrer)?;
            if used.saturating_add(incoming) > limit {
                log::debug!(
                    target: "lfs",
                    "Rejecting {incoming}-byte write: {referrer} at {used}/{limit}"
                );
                return Err(Error::QuotaExceeded { scope, limit });
            }
        }
        Ok(())
    }
}
