use std::sync::Arc;
use tracing::Instrument;

use crate::cache::{CacheError, SharedCache};
use crate::checks::{check_equal_result_response, check_expected_nameservers, check_lame, Finding};
use crate::metrics::Metrics;
use crate::query::{query_zone_parallel, NameserverClient, QueryGroup, QueryOptions};
use crate::util::names::{ancestor_zones, clean_domain};

/// The root nameservers, which every walk starts from.
pub const ROOT_SERVERS: [&str; 13] = [
    "a.root-servers.net",
    "b.root-servers.net",
    "c.root-servers.net",
    "d.root-servers.net",
    "e.root-servers.net",
    "f.root-servers.net",
    "g.root-servers.net",
    "h.root-servers.net",
    "i.root-servers.net",
    "j.root-servers.net",
    "k.root-servers.net",
    "l.root-servers.net",
    "m.root-servers.net",
];

/// Zone name to the nameservers to ask about the next zone down.
pub type ZoneCache = SharedCache<Vec<String>, ZoneError>;

/// A zone which could not be resolved.  Every domain beneath it fails
/// with the same error.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ZoneError {
    #[error("no nameservers to ask about {zone:?}")]
    NoNameservers { zone: String },
    #[error("every nameserver failed for {zone:?}: {servers:?}")]
    AllServersFailed { zone: String, servers: Vec<String> },
    #[error("resolution of {zone:?} was abandoned")]
    Abandoned { zone: String },
}

/// An internal error which ends the whole run.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AuditError {
    #[error("zone cache: {0}")]
    Cache(#[from] CacheError<ZoneError>),
}

/// One step of a domain's walk down the tree.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResolvedZone {
    pub zone: String,
    /// The nameservers to ask about the next zone down.
    pub servers: Vec<String>,
    /// Whether this walk resolved the zone, or took it from the cache.
    pub computed: bool,
}

/// A domain to audit, and the results of auditing it.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct DomainTask {
    pub name: String,
    pub lame: bool,
    pub problems: u64,
    pub findings: Vec<Finding>,
    /// Set if a zone could not be resolved, which stops the walk.
    pub error: Option<ZoneError>,
    pub trail: Vec<ResolvedZone>,
    pub metrics: Metrics,
}

impl DomainTask {
    pub fn new(name: &str) -> Self {
        Self {
            name: clean_domain(name),
            ..Default::default()
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    fn fail(&mut self, error: ZoneError) {
        tracing::warn!(%error, "could not resolve");
        self.problems += 1;
        self.findings.push(Finding::ResolutionFailed {
            domain: self.name.clone(),
            error: error.clone(),
        });
        self.error = Some(error);
    }

    fn record(&mut self, findings: Vec<Finding>) {
        for finding in &findings {
            tracing::debug!(%finding, "finding");
        }
        self.findings.extend(findings);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AuditConfig {
    /// Where every walk starts.
    pub root_servers: Vec<String>,
    /// If non-empty, every nameserver of an audited domain must be
    /// one of these, or a subdomain of one.
    pub expected_providers: Vec<String>,
    pub query: QueryOptions,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            root_servers: ROOT_SERVERS.iter().map(ToString::to_string).collect(),
            expected_providers: Vec::new(),
            query: QueryOptions::default(),
        }
    }
}

/// Walks domains down from the root, checking each delegation on the
/// way.  Zones are shared between walks through the cache, so each
/// zone is resolved and checked once no matter how many domains are
/// beneath it.
pub struct Auditor {
    client: Arc<dyn NameserverClient>,
    cache: ZoneCache,
    config: AuditConfig,
}

impl std::fmt::Debug for Auditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auditor")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Auditor {
    pub fn new(client: Arc<dyn NameserverClient>, mut config: AuditConfig) -> Self {
        config.expected_providers = config
            .expected_providers
            .iter()
            .map(|provider| clean_domain(provider))
            .collect();

        Self {
            client,
            cache: ZoneCache::new(),
            config,
        }
    }

    pub fn cache(&self) -> &ZoneCache {
        &self.cache
    }

    /// Walk a domain from its top-level zone down to the name itself,
    /// recording findings, lameness, and problems on the task.
    ///
    /// A zone which cannot be resolved is recorded on the task and
    /// stops the walk, but is not an error: other domains carry on.
    ///
    /// # Errors
    ///
    /// If the zone cache is used inconsistently, which is a bug.
    pub async fn audit(&self, task: &mut DomainTask) -> Result<(), AuditError> {
        let zones = ancestor_zones(&task.name);
        let mut servers = self.config.root_servers.clone();

        for (i, zone) in zones.iter().enumerate() {
            let is_leaf = i + 1 == zones.len();

            if let Some(publisher) = self.cache.claim(zone) {
                task.metrics.zone_cache_miss();
                tracing::debug!(%zone, ?servers, "resolving");

                let (group, next) = self.resolve_zone(zone, &servers, &mut task.metrics).await;
                publisher.publish(next.clone());

                match next {
                    Ok(next) => {
                        task.trail.push(ResolvedZone {
                            zone: zone.clone(),
                            servers: next.clone(),
                            computed: true,
                        });
                        servers = next;
                    }
                    Err(error) => {
                        if let Some(group) = &group {
                            check_responses(group, task);
                        }
                        task.fail(error);
                        return Ok(());
                    }
                }

                if let Some(group) = group {
                    self.check_zone(&group, is_leaf, task)
                        .instrument(tracing::error_span!("check_zone", %zone))
                        .await;
                }
            } else {
                task.metrics.zone_cache_hit();
                tracing::trace!(%zone, "waiting for cache");

                match self.cache.wait(zone).await {
                    Ok(next) => {
                        tracing::trace!(%zone, servers = ?next, "got servers from cache");
                        task.trail.push(ResolvedZone {
                            zone: zone.clone(),
                            servers: next.clone(),
                            computed: false,
                        });
                        servers = next;
                    }
                    Err(CacheError::Failed(error)) => {
                        task.fail(error);
                        return Ok(());
                    }
                    Err(CacheError::Abandoned(zone)) => {
                        task.fail(ZoneError::Abandoned { zone });
                        return Ok(());
                    }
                    Err(error) => return Err(error.into()),
                }
            }
        }

        if task.trail.iter().all(|step| !step.computed) {
            tracing::debug!("every zone came from the cache, possible duplicate");
        }

        Ok(())
    }

    /// Ask the current servers about a zone and work out which servers
    /// to ask about the next zone down: the zone's nameservers if it
    /// has any, otherwise whichever of the current servers answered
    /// authoritatively.
    async fn resolve_zone(
        &self,
        zone: &str,
        servers: &[String],
        metrics: &mut Metrics,
    ) -> (Option<QueryGroup>, Result<Vec<String>, ZoneError>) {
        if servers.is_empty() {
            let error = ZoneError::NoNameservers {
                zone: zone.to_string(),
            };
            return (None, Err(error));
        }

        let group =
            query_zone_parallel(self.client.as_ref(), zone, servers, &self.config.query, metrics)
                .await;
        tracing::trace!(%group, "got result");

        if group.all_failed() {
            let error = ZoneError::AllServersFailed {
                zone: zone.to_string(),
                servers: servers.to_vec(),
            };
            return (Some(group), Err(error));
        }

        let next = if group.nameservers.is_empty() {
            let authoritative = group.authoritative_servers();
            tracing::debug!(%zone, ?authoritative, "no nameservers - using authoritative servers");
            authoritative
        } else {
            group.nameservers.clone()
        };

        (Some(group), Ok(next))
    }

    async fn check_zone(&self, group: &QueryGroup, is_leaf: bool, task: &mut DomainTask) {
        check_responses(group, task);

        let lame =
            check_lame(self.client.as_ref(), group, &self.config.query, &mut task.metrics).await;
        if lame.lame {
            task.lame = true;
            task.problems += 1;
        }
        task.record(lame.findings);

        if is_leaf {
            let unexpected = check_expected_nameservers(group, &self.config.expected_providers);
            task.problems += unexpected.len() as u64;
            task.record(unexpected);
        }
    }
}

/// One problem per server which errored or disagreed with the rest.
fn check_responses(group: &QueryGroup, task: &mut DomainTask) {
    let varying = check_equal_result_response(group);
    task.problems += varying.len() as u64;
    task.record(varying);
}
