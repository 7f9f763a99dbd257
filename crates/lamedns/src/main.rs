use clap::{CommandFactory, Parser, ValueEnum};
use futures::future::try_join_all;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dns_audit::{AuditConfig, AuditError, Auditor, DomainTask, Jobs, NetworkClient, QueryOptions};

mod metrics;
mod report;
mod sources;

/// Anything which ends the run early.
#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error("could not write report: {0}")]
    Output(#[from] std::io::Error),
    #[error("{0}")]
    Config(String),
    #[error("could not read list {path:?}: {source}")]
    ReadList {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("interrupted")]
    Interrupted,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser)]
/// Audit the delegations of a set of domains, walking each one down
/// from the root nameservers.
///
/// At every zone, lamedns checks that:
///
/// - the parent's nameservers agree on the delegation
///
/// - the delegated nameservers agree with the parent, and answer
///   authoritatively (if not, the delegation is lame)
///
/// - the domain's own nameservers are under an expected provider, if
///   any are given
///
/// Findings and a summary are written to stdout, logs to stderr.
struct Args {
    /// Domains to audit
    domains: Vec<String>,

    /// Number of domains to audit at once
    #[clap(short, long, default_value_t = 10, env = "LAMEDNS_PARALLEL")]
    parallel: usize,

    /// Comma-separated files of domains to audit, one per line, can be
    /// specified more than once
    #[clap(short, long, value_delimiter = ',', env = "LAMEDNS_LIST")]
    list: Vec<PathBuf>,

    /// Comma-separated domains which every nameserver should be under,
    /// anything else is a finding
    #[clap(short, long, value_delimiter = ',', env = "LAMEDNS_EXPECTED_NS")]
    expected_ns: Vec<String>,

    /// Show debug logs, including every finding as it is discovered
    #[clap(short, long, env = "LAMEDNS_VERBOSE")]
    verbose: bool,

    /// Seconds to wait for a nameserver to answer
    #[clap(long, default_value_t = 10, env = "LAMEDNS_TIMEOUT")]
    timeout: u64,

    /// Times to ask a nameserver before giving up on it
    #[clap(long, default_value_t = dns_audit::query::DEFAULT_RETRIES, env = "LAMEDNS_RETRIES")]
    retries: usize,

    /// Milliseconds to wait between attempts
    #[clap(long, default_value_t = 1000, env = "LAMEDNS_RETRY_BACKOFF_MS")]
    retry_backoff_ms: u64,

    /// Address to serve Prometheus metrics on, at /metrics
    #[clap(long, env = "LAMEDNS_METRICS_ADDRESS")]
    metrics_address: Option<SocketAddr>,

    /// Format of the logs
    #[clap(long, value_enum, default_value_t = LogFormat::Text, env = "LAMEDNS_LOG_FORMAT")]
    log_format: LogFormat,
}

impl Args {
    fn validate(&self) -> Result<(), RunError> {
        if self.domains.is_empty() && self.list.is_empty() {
            return Err(RunError::Config(
                "need to pass at least one name or input source to scan".to_string(),
            ));
        }
        if self.parallel < 1 {
            return Err(RunError::Config(
                "must enter a positive number of parallel workers".to_string(),
            ));
        }
        Ok(())
    }

    fn audit_config(&self) -> AuditConfig {
        AuditConfig {
            expected_providers: self.expected_ns.clone(),
            query: QueryOptions {
                retries: self.retries,
                retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            },
            ..Default::default()
        }
    }
}

fn begin_logging(args: &Args) {
    let default = if args.verbose {
        "lamedns=debug,dns_audit=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let registry = tracing_subscriber::registry().with(filter);

    match args.log_format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

async fn run(args: Args) -> Result<(), RunError> {
    let client = NetworkClient::new(Duration::from_secs(args.timeout));
    let auditor = Arc::new(Auditor::new(Arc::new(client), args.audit_config()));
    let jobs = Jobs::<DomainTask, RunError>::new();

    jobs.spawn_collector(|collected| async move {
        let mut stdout = tokio::io::stdout();
        match report::report(collected, &mut stdout).await {
            Ok(_) => Ok(()),
            Err(error) => Err(RunError::Output(error)),
        }
    });

    tracing::info!(workers = %args.parallel, "starting");
    for _ in 0..args.parallel {
        let auditor = Arc::clone(&auditor);
        jobs.spawn_worker(move |jobs, mut task: DomainTask| {
            let auditor = Arc::clone(&auditor);
            async move {
                let span = tracing::error_span!("audit", domain = %task.name);
                let result = auditor.audit(&mut task).instrument(span).await;
                jobs.complete(task).await;
                result.map_err(RunError::Audit)
            }
        });
    }

    jobs.submit(sources::to_tasks(args.domains));

    let loads = args.list.into_iter().map(|path| {
        let jobs = jobs.clone();
        async move {
            match sources::read_list(&path).await {
                Ok(names) => {
                    tracing::debug!(?path, count = %names.len(), "read list");
                    jobs.submit(sources::to_tasks(names));
                    Ok(())
                }
                Err(source) => Err(RunError::ReadList { path, source }),
            }
        }
    });
    if let Err(error) = try_join_all(loads).await {
        jobs.fail(error);
    }

    tokio::select! {
        result = jobs.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("quitting from signal");
            jobs.cancel();
            Err(RunError::Interrupted)
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(error) = args.validate() {
        Args::command()
            .error(clap::error::ErrorKind::ValueValidation, error)
            .exit();
    }

    begin_logging(&args);

    if let Some(address) = args.metrics_address {
        tracing::info!(%address, "serving metrics");
        tokio::spawn(async move {
            if let Err(error) = metrics::serve_prometheus_endpoint_task(address).await {
                tracing::error!(?error, "could not serve metrics");
            }
        });
    }

    let start = Instant::now();
    if let Err(error) = run(args).await {
        tracing::error!(%error, "run failed");
        process::exit(1);
    }
    tracing::info!(took = ?start.elapsed(), "done");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("lamedns").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let args = parse(&["example.com"]);

        assert_eq!(vec!["example.com".to_string()], args.domains);
        assert_eq!(10, args.parallel);
        assert!(!args.verbose);
        assert_eq!(LogFormat::Text, args.log_format);
        assert!(args.validate().is_ok());

        let config = args.audit_config();
        assert_eq!(QueryOptions::default(), config.query);
        assert_eq!(13, config.root_servers.len());
        assert!(config.expected_providers.is_empty());
    }

    #[test]
    fn comma_separated_lists() {
        let args = parse(&[
            "--list",
            "a.txt,b.txt",
            "-l",
            "c.txt",
            "--expected-ns",
            "dns-provider.example,other.example",
        ]);

        assert_eq!(
            vec![
                PathBuf::from("a.txt"),
                PathBuf::from("b.txt"),
                PathBuf::from("c.txt")
            ],
            args.list
        );
        assert_eq!(
            vec!["dns-provider.example".to_string(), "other.example".to_string()],
            args.audit_config().expected_providers
        );
        assert!(args.validate().is_ok());
    }

    #[test]
    fn no_input_is_rejected() {
        assert!(matches!(parse(&[]).validate(), Err(RunError::Config(_))));
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(matches!(
            parse(&["-p", "0", "example.com"]).validate(),
            Err(RunError::Config(_))
        ));
    }

    #[test]
    fn query_options_from_args() {
        let args = parse(&["--retries", "5", "--retry-backoff-ms", "250", "example.com"]);

        assert_eq!(
            QueryOptions {
                retries: 5,
                retry_backoff: Duration::from_millis(250),
            },
            args.audit_config().query
        );
    }
}
