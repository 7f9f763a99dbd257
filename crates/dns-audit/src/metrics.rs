/// Metrics from auditing one domain.  The auditor builds this
/// structure rather than update the Prometheus metrics directly.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct Metrics {
    /// Individual NS queries sent to a nameserver, including retries.
    pub nameserver_queries: u64,
    /// Query attempts which failed and were retried.
    pub nameserver_retries: u64,
    /// Nameservers which failed every attempt.
    pub nameserver_failures: u64,
    /// Zones this domain's walk computed itself.
    pub zone_cache_misses: u64,
    /// Zones this domain's walk took from the cache, possibly after
    /// waiting for another walk to compute them.
    pub zone_cache_hits: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_nameserver_queries(&mut self, queries: usize) {
        self.nameserver_queries += queries as u64;
    }

    pub fn add_nameserver_retries(&mut self, retries: usize) {
        self.nameserver_retries += retries as u64;
    }

    pub fn nameserver_failure(&mut self) {
        self.nameserver_failures += 1;
    }

    pub fn zone_cache_miss(&mut self) {
        self.zone_cache_misses += 1;
    }

    pub fn zone_cache_hit(&mut self) {
        self.zone_cache_hits += 1;
    }
}
