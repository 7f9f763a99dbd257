use std::fmt;

use crate::audit::ZoneError;
use crate::metrics::Metrics;
use crate::query::{query_zone_parallel, NameserverClient, QueryError, QueryGroup, QueryOptions};
use crate::util::names::{difference, is_subdomain_of};

/// Something wrong with a delegation, found by one of the checks.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Finding {
    /// A nameserver did not answer at all.
    ServerError {
        zone: String,
        server: String,
        error: QueryError,
    },

    /// A nameserver returned a different number of NS records to the
    /// union of every nameserver's answer.
    VaryingResponses {
        zone: String,
        server: String,
        expected: usize,
        got: usize,
        missing: Vec<String>,
    },

    /// Asking the zone's own nameservers gave a different NS set to
    /// the delegation from the parent.
    NameserverMismatch {
        zone: String,
        expected: Vec<String>,
        got: Vec<String>,
    },

    /// The zone's own nameservers listed nameservers the parent does
    /// not delegate to.
    ExtraNameservers { zone: String, extra: Vec<String> },

    /// A delegated nameserver does not answer authoritatively.
    NotAuthoritative { zone: String, server: String },

    /// A nameserver outside every expected provider.
    UnexpectedNameserver { zone: String, nameserver: String },

    /// The domain could not be audited, because one of its zones
    /// could not be resolved.
    ResolutionFailed { domain: String, error: ZoneError },
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::ServerError {
                zone,
                server,
                error,
            } => write!(f, "ERROR server: {zone:?} @{server}: {error}"),
            Finding::VaryingResponses {
                zone,
                server,
                expected,
                got,
                missing,
            } => write!(
                f,
                "varying responses: expected {expected}, got {got}, for {zone:?} @{server}. missing: {missing:?}"
            ),
            Finding::NameserverMismatch {
                zone,
                expected,
                got,
            } => write!(
                f,
                "unexpected difference in nameservers: domain: {zone:?} expected {}: {expected:?}, got {}: {got:?}",
                expected.len(),
                got.len()
            ),
            Finding::ExtraNameservers { zone, extra } => {
                write!(f, "> extra nameservers returned by authoritative NS: {zone:?}: {extra:?}")
            }
            Finding::NotAuthoritative { zone, server } => {
                write!(f, "lame delegation: {server:?} is not authoritative for {zone:?}")
            }
            Finding::UnexpectedNameserver { zone, nameserver } => {
                write!(f, "unexpected nameserver: {zone:?} NS {nameserver:?}")
            }
            Finding::ResolutionFailed { domain, error } => {
                write!(f, "ERROR resolving {domain:?}: {error}")
            }
        }
    }
}

/// Check that every nameserver gave the same answer.  Each server
/// which errored, or which returned a different number of NS records
/// to the union, is one finding.
pub fn check_equal_result_response(group: &QueryGroup) -> Vec<Finding> {
    let expected = group.nameservers.len();

    group
        .results
        .iter()
        .filter_map(|(server, result)| {
            if let Some(error) = &result.error {
                Some(Finding::ServerError {
                    zone: group.zone.clone(),
                    server: server.clone(),
                    error: error.clone(),
                })
            } else if result.nameservers.len() == expected {
                None
            } else {
                Some(Finding::VaryingResponses {
                    zone: group.zone.clone(),
                    server: server.clone(),
                    expected,
                    got: result.nameservers.len(),
                    missing: difference(&group.nameservers, &result.nameservers),
                })
            }
        })
        .collect()
}

/// Outcome of `check_lame`.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct LameCheck {
    pub lame: bool,
    pub findings: Vec<Finding>,
}

/// Ask the nameservers a zone is delegated to about the zone itself.
/// The delegation is lame if they report a different NS set to the
/// one the parent gave, or if any of them does not answer
/// authoritatively (which includes not answering at all).
pub async fn check_lame(
    client: &dyn NameserverClient,
    group: &QueryGroup,
    options: &QueryOptions,
    metrics: &mut Metrics,
) -> LameCheck {
    let direct =
        query_zone_parallel(client, &group.zone, &group.nameservers, options, metrics).await;
    tracing::trace!(%direct, "direct query");

    let mut check = LameCheck::default();

    if group.nameservers != direct.nameservers {
        check.lame = true;
        check.findings.push(Finding::NameserverMismatch {
            zone: group.zone.clone(),
            expected: group.nameservers.clone(),
            got: direct.nameservers.clone(),
        });

        let extra = difference(&direct.nameservers, &group.nameservers);
        if !extra.is_empty() {
            check.findings.push(Finding::ExtraNameservers {
                zone: group.zone.clone(),
                extra,
            });
        }
    }

    for (server, result) in &direct.results {
        if !result.authoritative {
            check.lame = true;
            check.findings.push(Finding::NotAuthoritative {
                zone: group.zone.clone(),
                server: server.clone(),
            });
        }
    }

    check
}

/// Check every nameserver of the zone belongs to one of the expected
/// providers.  Each one which does not is one finding.  With no
/// providers configured, anything goes.
pub fn check_expected_nameservers(group: &QueryGroup, providers: &[String]) -> Vec<Finding> {
    if providers.is_empty() {
        return Vec::new();
    }

    group
        .nameservers
        .iter()
        .filter(|ns| !providers.iter().any(|provider| is_subdomain_of(ns, provider)))
        .map(|ns| Finding::UnexpectedNameserver {
            zone: group.zone.clone(),
            nameserver: ns.clone(),
        })
        .collect()
}
