use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tracing::Instrument;

use crate::metrics::Metrics;
use crate::util::names::clean_domain;

/// How many times a single nameserver is asked before giving up.
pub const DEFAULT_RETRIES: usize = 3;

/// Pause between attempts against the same nameserver.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// The NS records one nameserver returned for a zone, from both the
/// ANSWER and AUTHORITY sections, and whether it claimed authority.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct NsAnswer {
    pub nameservers: Vec<String>,
    pub authoritative: bool,
}

/// Something which can ask one nameserver for the NS records of a
/// zone.  `NetworkClient` is the real implementation; tests script
/// their own.
#[async_trait]
pub trait NameserverClient: Send + Sync {
    /// Send a single non-recursive NS query for `zone` to `server`,
    /// which may be a hostname or an IP address.
    async fn query_ns(&self, server: &str, zone: &str) -> Result<NsAnswer, QueryError>;
}

/// Why a query to a single nameserver failed.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error("could not find an address for {server:?}: {reason}")]
    NoAddress { server: String, reason: String },
    #[error("could not serialise query: {0}")]
    Serialise(String),
    #[error("could not parse response: {0}")]
    Deserialise(String),
    #[error("response does not match the query")]
    Mismatch,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    IO(String),
}

/// Retry policy for the query layer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct QueryOptions {
    /// Attempts per nameserver; treated as at least 1.
    pub retries: usize,
    pub retry_backoff: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// The outcome of asking one nameserver about one zone.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct QueryResult {
    pub error: Option<QueryError>,
    pub authoritative: bool,
    /// Sorted and deduplicated.
    pub nameservers: Vec<String>,
}

impl QueryResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl fmt::Display for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(error) => write!(f, "error: {error}"),
            None => write!(f, "aa: {}, ns: {:?}", self.authoritative, self.nameservers),
        }
    }
}

/// The outcome of asking a set of nameservers about one zone.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct QueryGroup {
    pub zone: String,
    /// Keyed by the queried server.
    pub results: BTreeMap<String, QueryResult>,
    /// Union of the nameservers from every non-error result, sorted.
    pub nameservers: Vec<String>,
}

impl QueryGroup {
    /// Build a group from per-server results, computing the union.
    pub fn new(zone: &str, results: BTreeMap<String, QueryResult>) -> Self {
        let nameservers = results
            .values()
            .filter(|result| !result.is_error())
            .flat_map(|result| result.nameservers.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        Self {
            zone: clean_domain(zone),
            results,
            nameservers,
        }
    }

    /// The queried servers which answered authoritatively, sorted.
    pub fn authoritative_servers(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|(_, result)| result.authoritative)
            .map(|(server, _)| server.clone())
            .collect()
    }

    /// Whether at least one server was asked and none of them
    /// answered.
    pub fn all_failed(&self) -> bool {
        !self.results.is_empty() && self.results.values().all(QueryResult::is_error)
    }
}

impl fmt::Display for QueryGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: all ns: {:?}", self.zone, self.nameservers)?;
        for (server, result) in &self.results {
            write!(f, "; @{server} {result}")?;
        }
        Ok(())
    }
}

/// Ask every server in `servers` for the NS records of `zone`, all at
/// once.  A failing server never fails the group: its error is
/// recorded in its own result.
pub async fn query_zone_parallel(
    client: &dyn NameserverClient,
    zone: &str,
    servers: &[String],
    options: &QueryOptions,
    metrics: &mut Metrics,
) -> QueryGroup {
    let queries = servers.iter().map(|server| {
        query_server(client, server, zone, options)
            .instrument(tracing::error_span!("query_server", %server))
    });

    let mut results = BTreeMap::new();
    for (server, (result, attempts)) in servers.iter().zip(join_all(queries).await) {
        metrics.add_nameserver_queries(attempts);
        if result.is_error() {
            metrics.nameserver_failure();
            metrics.add_nameserver_retries(attempts);
        } else {
            metrics.add_nameserver_retries(attempts - 1);
        }
        results.insert(server.clone(), result);
    }

    QueryGroup::new(zone, results)
}

/// Query a single server, retrying with a fixed back-off.  Returns
/// the result and the number of attempts made.
async fn query_server(
    client: &dyn NameserverClient,
    server: &str,
    zone: &str,
    options: &QueryOptions,
) -> (QueryResult, usize) {
    let attempts = options.retries.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match client.query_ns(server, zone).await {
            Ok(answer) => {
                let mut nameservers = answer
                    .nameservers
                    .iter()
                    .map(|ns| clean_domain(ns))
                    .collect::<Vec<_>>();
                nameservers.sort();
                nameservers.dedup();

                tracing::trace!(authoritative = %answer.authoritative, ?nameservers, "got answer");
                let result = QueryResult {
                    error: None,
                    authoritative: answer.authoritative,
                    nameservers,
                };
                return (result, attempt);
            }
            Err(error) => {
                tracing::debug!(%attempt, %error, "query failed");
                last_error = Some(error);
                if attempt < attempts {
                    sleep(options.retry_backoff).await;
                }
            }
        }
    }

    let result = QueryResult {
        error: last_error,
        authoritative: false,
        nameservers: Vec::new(),
    };
    (result, attempts)
}
