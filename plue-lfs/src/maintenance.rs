//! Background maintenance.
//!
//! A single thread periodically vacuums orphaned objects, applies the tier
//! policy, verifies a sampled fraction of objects for corruption and
//! scavenges abandoned upload state. Tier moves and deletions never happen
//! on the read path.
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel as chan;

use crate::tiered::TierPolicy;
use crate::Objects;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub interval: Duration,
    /// Fraction of live objects to integrity-check per cycle.
    pub sample_fraction: f64,
    /// Objects considered for tier moves per cycle.
    pub tier_sample: usize,
    pub tier_policy: TierPolicy,
    /// Upload temp state older than this is scavenged.
    pub tmp_max_age_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            sample_fraction: 0.01,
            tier_sample: 256,
            tier_policy: TierPolicy::default(),
            tmp_max_age_secs: 24 * 3600,
        }
    }
}

/// Handle to the running maintenance thread.
pub struct Maintenance {
    stop: chan::Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Maintenance {
    /// Start the background thread.
    pub fn start(objects: Arc<Objects>, config: MaintenanceConfig) -> Maintenance {
        let (stop, stopped) = chan::bounded(1);
        let ticker = chan::tick(config.interval);
        let thread = thread::Builder::new()
            .name("lfs-maintenance".to_owned())
            .spawn(move || loop {
                chan::select! {
                    recv(stopped) -> _ => break,
                    recv(ticker) -> _ => run_once(&objects, &config),
                }
            })
            .expect("lfs: failed to spawn maintenance thread");
        Maintenance {
            stop,
            thread: Some(thread),
        }
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.stop.send(()).ok();
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.stop.send(()).ok();
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}

/// One maintenance cycle. Public so operators can run it on demand.
pub fn run_once(objects: &Objects, config: &MaintenanceConfig) {
    let now = unix_now();

    match objects.vacuum(now) {
        Ok(0) => {}
        Ok(removed) => log::info!(target: "lfs", "Vacuumed {removed} orphaned object(s)"),
        Err(err) => log::error!(target: "lfs", "Vacuum failed: {err}"),
    }

    match objects.scavenge(config.tmp_max_age_secs) {
        Ok(0) => {}
        Ok(removed) => log::info!(target: "lfs", "Scavenged {removed} stale upload dir(s)"),
        Err(err) => log::error!(target: "lfs", "Scavenge failed: {err}"),
    }

    match objects.apply_tier_policy(&config.tier_policy, config.tier_sample, now) {
        Ok(0) => {}
        Ok(moved) => log::info!(target: "lfs", "Migrated {moved} object(s) between tiers"),
        Err(err) => log::error!(target: "lfs", "Tier sweep failed: {err}"),
    }

    let sample = match objects.meta().count() {
        Ok(count) => ((count as f64 * config.sample_fraction).ceil() as usize).max(1),
        Err(err) => {
            log::error!(target: "lfs", "Metadata unavailable: {err}");
            return;
        }
    };
    match objects.sweep(sample) {
        Ok(corrupt) if corrupt.is_empty() => {}
        Ok(corrupt) => {
            log::error!(target: "lfs", "Integrity sweep found {} corrupt object(s)", corrupt.len());
        }
        Err(err) => log::error!(target: "lfs", "Integrity sweep failed: {err}"),
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::meta::{Meta, Referrer};
    use crate::oid::Oid;
    use crate::quota::QuotaManager;
    use plue::repo::RepoId;

    #[test]
    fn test_cycle_vacuums_and_verifies() {
        let objects = Arc::new(
            Objects::new(
                Box::new(MemoryBackend::new()),
                Meta::memory().unwrap(),
                QuotaManager::default(),
            )
            .with_grace_secs(0),
        );
        let content = b"short lived";
        let oid = Oid::of(content);
        objects
            .put(&oid, content, &[Referrer::Repository(RepoId(1))], 0)
            .unwrap();
        objects.delete(&oid, Referrer::Repository(RepoId(1)), 0).unwrap();

        run_once(&objects, &MaintenanceConfig::default());
        assert!(!objects.exists(&oid).unwrap());
    }

    #[test]
    fn test_start_and_stop() {
        let objects = Arc::new(Objects::new(
            Box::new(MemoryBackend::new()),
            Meta::memory().unwrap(),
            QuotaManager::default(),
        ));
        let maintenance = Maintenance::start(
            objects,
            MaintenanceConfig {
                interval: Duration::from_millis(10),
                ..MaintenanceConfig::default()
            },
        );
        std::thread::sleep(Duration::from_millis(50));
        maintenance.stop();
    }
}
