//! Lock-free access to the live policy set, plus periodic file reloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::policy::RateLimitPolicy;
use super::rules::PolicySet;
use super::subject::PrincipalTier;
use crate::error::Result;

/// Resolves effective policies against an atomically swappable snapshot.
///
/// Readers never lock; a reload publishes a whole new [`PolicySet`] so an
/// in-flight request sees either the old set or the new one.
#[derive(Debug)]
pub struct PolicyResolver {
    current: ArcSwap<PolicySet>,
}

impl PolicyResolver {
    pub fn new(policies: PolicySet) -> Self {
        Self {
            current: ArcSwap::from_pointee(policies),
        }
    }

    /// Produce the effective policy for one request.
    pub fn resolve(
        &self,
        tier: PrincipalTier,
        service_tag: Option<&str>,
        endpoint_tag: Option<&str>,
    ) -> RateLimitPolicy {
        self.current.load().resolve(tier, service_tag, endpoint_tag)
    }

    /// The policy set currently in effect.
    pub fn snapshot(&self) -> Arc<PolicySet> {
        self.current.load_full()
    }

    /// Publish a new policy set.
    pub fn replace(&self, policies: PolicySet) {
        self.current.store(Arc::new(policies));
    }

    /// Load, validate and publish a policy file.
    ///
    /// On error the current set stays in effect.
    pub fn reload_from_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let policies = PolicySet::from_file(path)?;
        self.replace(policies);
        Ok(())
    }
}

impl Default for PolicyResolver {
    fn default() -> Self {
        Self::new(PolicySet::builtin())
    }
}

/// Re-reads a policy file on a fixed interval.
pub struct PolicyWatcher {
    resolver: Arc<PolicyResolver>,
    path: PathBuf,
    interval: Duration,
}

impl PolicyWatcher {
    pub fn new(resolver: Arc<PolicyResolver>, path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            resolver,
            path: path.into(),
            interval,
        }
    }

    /// Check the file once. Returns `true` if a new set was published.
    ///
    /// Unchanged contents are skipped; invalid contents are logged and the
    /// previous set is kept.
    pub fn poll(&self, last_contents: &mut Option<String>) -> bool {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to read policy file");
                return false;
            }
        };

        if last_contents.as_deref() == Some(contents.as_str()) {
            debug!(path = %self.path.display(), "Policy file unchanged");
            return false;
        }

        match PolicySet::from_yaml(&contents) {
            Ok(policies) => {
                self.resolver.replace(policies);
                *last_contents = Some(contents);
                info!(path = %self.path.display(), "Rate limit policies reloaded");
                true
            }
            Err(e) => {
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "Rejected invalid policy file, keeping previous policies"
                );
                false
            }
        }
    }

    /// Run the watcher until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_contents = std::fs::read_to_string(&self.path).ok();
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the file was loaded at startup.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.poll(&mut last_contents);
            }
        })
    }
}
