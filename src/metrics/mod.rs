use autometrics::prometheus_exporter;
use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::Histogram;
use prometheus::HistogramOpts;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use warp::Filter;
use warp::Rejection;
use warp::Reply;


lazy_static! {
    pub static ref ELECTION_ROUNDS: IntCounter =
        IntCounter::new("election_rounds", "Vote exchange rounds while LOOKING")
            .expect("metric can not be created");

    pub static ref ELECTIONS_COMPLETED: IntCounter =
        IntCounter::new("elections_completed", "Elections that settled on a leader")
            .expect("metric can not be created");

    pub static ref ROLE_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("role_transitions", "Roles entered by the peer loop"),
        &["role"]
    )
    .expect("metric can not be created");

    pub static ref ROLE_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("role_failures", "Roles that ended with an error"),
        &["role", "kind"]
    )
    .expect("metric can not be created");

    pub static ref PROPOSALS_TOTAL: IntCounter =
        IntCounter::new("proposals_total", "Proposals issued as leader")
            .expect("metric can not be created");

    pub static ref COMMITS_TOTAL: IntCounter =
        IntCounter::new("commits_total", "Proposals committed as leader")
            .expect("metric can not be created");

    pub static ref OUTSTANDING_PROPOSALS: IntGauge =
        IntGauge::new("outstanding_proposals", "Proposals waiting for a quorum")
            .expect("metric can not be created");

    pub static ref SYNCED_FOLLOWERS: IntGauge =
        IntGauge::new("synced_followers", "Followers that acknowledged NEWLEADER")
            .expect("metric can not be created");

    pub static ref FOLLOWER_SYNC_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("follower_sync_total", "Follower synchronizations by mode"),
        &["mode"]
    )
    .expect("metric can not be created");

    pub static ref COMMIT_LATENCY_MS: Histogram = Histogram::with_opts(
        HistogramOpts::new("commit_latency_ms", "Histogram of proposal to commit latency in ms")
            .buckets(exponential_buckets(0.5, 2.0, 16).expect("valid buckets"))
    )
    .expect("metric can not be created");

    pub static ref SNAPSHOTS_TOTAL: IntCounter =
        IntCounter::new("snapshots_total", "Snapshots written to disk")
            .expect("metric can not be created");

    pub static ref LAST_COMMITTED_ZXID: IntGauge =
        IntGauge::new("last_committed_zxid", "Packed zxid of the last applied transaction")
            .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

pub fn register_custom_metrics(registry: &Registry) {
    registry
        .register(Box::new(ELECTION_ROUNDS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(ELECTIONS_COMPLETED.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(ROLE_TRANSITIONS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(ROLE_FAILURES.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(PROPOSALS_TOTAL.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(COMMITS_TOTAL.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(OUTSTANDING_PROPOSALS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(SYNCED_FOLLOWERS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(FOLLOWER_SYNC_TOTAL.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(COMMIT_LATENCY_MS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(SNAPSHOTS_TOTAL.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(LAST_COMMITTED_ZXID.clone()))
        .expect("collector can be registered");
}

/// Serves `/metrics` until `shutdown_signal` fires.
pub async fn start_server(
    port: u16,
    mut shutdown_signal: watch::Receiver<()>,
) {
    register_custom_metrics(&REGISTRY);

    let metrics_route = warp::path!("metrics").and_then(metrics_handler);

    let (addr, server) = warp::serve(metrics_route).bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
        let _ = shutdown_signal.changed().await;
    });
    info!("metrics server listening on {}", addr);
    server.await;
}

async fn metrics_handler() -> Result<impl Reply, Rejection> {
    Ok(gather_metrics())
}

/// Custom registry, default registry and autometrics output in the
/// Prometheus text format.
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut body = String::new();
    for families in [REGISTRY.gather(), prometheus::gather()] {
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            error!("could not encode metrics: {}", e);
            continue;
        }
        match String::from_utf8(buffer) {
            Ok(text) => body.push_str(&text),
            Err(e) => error!("metrics could not be from_utf8'd: {}", e),
        }
    }
    body.push_str(&prometheus_exporter::encode_http_response().into_body());
    body
}
