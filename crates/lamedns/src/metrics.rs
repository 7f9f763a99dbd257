use axum::{http::StatusCode, routing};
use prometheus::{opts, register_int_counter, IntCounter, TextEncoder};
use std::net::SocketAddr;
use std::sync::LazyLock;

use dns_audit::DomainTask;

pub static DOMAINS_AUDITED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "lamedns_domains_audited_total",
        "Total number of domains audited, whether they could be resolved or not."
    ))
    .unwrap()
});

pub static DOMAINS_LAME_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "lamedns_domains_lame_total",
        "Total number of domains with a lame delegation somewhere above them."
    ))
    .unwrap()
});

pub static DOMAINS_FAILED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "lamedns_domains_failed_total",
        "Total number of domains which could not be resolved."
    ))
    .unwrap()
});

pub static PROBLEMS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "lamedns_problems_total",
        "Total number of problems found."
    ))
    .unwrap()
});

pub static NAMESERVER_QUERIES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "lamedns_nameserver_queries_total",
        "Total number of NS queries sent to nameservers, including retries."
    ))
    .unwrap()
});

pub static NAMESERVER_RETRIES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "lamedns_nameserver_retries_total",
        "Total number of NS queries which failed and were retried."
    ))
    .unwrap()
});

pub static NAMESERVER_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "lamedns_nameserver_failures_total",
        "Total number of nameservers which failed every attempt."
    ))
    .unwrap()
});

pub static ZONE_CACHE_HIT_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "lamedns_zone_cache_hit_total",
        "Total number of zones taken from the cache."
    ))
    .unwrap()
});

pub static ZONE_CACHE_MISS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "lamedns_zone_cache_miss_total",
        "Total number of zones resolved."
    ))
    .unwrap()
});

/// Fold a finished domain into the Prometheus metrics.
pub fn record_task(task: &DomainTask) {
    DOMAINS_AUDITED_TOTAL.inc();
    if task.lame {
        DOMAINS_LAME_TOTAL.inc();
    }
    if task.is_failed() {
        DOMAINS_FAILED_TOTAL.inc();
    }
    PROBLEMS_TOTAL.inc_by(task.problems);

    NAMESERVER_QUERIES_TOTAL.inc_by(task.metrics.nameserver_queries);
    NAMESERVER_RETRIES_TOTAL.inc_by(task.metrics.nameserver_retries);
    NAMESERVER_FAILURES_TOTAL.inc_by(task.metrics.nameserver_failures);
    ZONE_CACHE_HIT_TOTAL.inc_by(task.metrics.zone_cache_hits);
    ZONE_CACHE_MISS_TOTAL.inc_by(task.metrics.zone_cache_misses);
}

async fn get_metrics() -> (StatusCode, String) {
    match TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(metrics_str) => (StatusCode::OK, metrics_str),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

pub async fn serve_prometheus_endpoint_task(address: SocketAddr) -> std::io::Result<()> {
    let app = axum::Router::new().route("/metrics", routing::get(get_metrics));
    let listener = tokio::net::TcpListener::bind(address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
