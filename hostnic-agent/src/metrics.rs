use std::sync::{LazyLock, RwLock};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::{Registry, Unit};

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("hostnic")));

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RpcLabels {
    pub method: String,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MethodLabels {
    pub method: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RetryLabels {
    pub op: String,
}

pub static RPC_CALLS: LazyLock<Family<RpcLabels, Counter>> = LazyLock::new(|| {
    let calls = Family::<RpcLabels, Counter>::default();
    REGISTRY
        .write()
        .unwrap()
        .register("rpc_calls", "Number of backend RPC calls", calls.clone());
    calls
});

pub static RPC_DURATION: LazyLock<Family<MethodLabels, Histogram>> = LazyLock::new(|| {
    let duration = Family::<MethodLabels, Histogram>::new_with_constructor(|| {
        Histogram::new(exponential_buckets(0.005, 2.0, 12))
    });
    REGISTRY.write().unwrap().register_with_unit(
        "rpc_duration",
        "Backend RPC latency",
        Unit::Seconds,
        duration.clone(),
    );
    duration
});

pub static POOL_TOTAL: LazyLock<Gauge> = LazyLock::new(|| {
    let g = Gauge::default();
    REGISTRY.write().unwrap().register(
        "pool_addresses",
        "Addresses carried on secondary nics",
        g.clone(),
    );
    g
});

pub static POOL_ASSIGNED: LazyLock<Gauge> = LazyLock::new(|| {
    let g = Gauge::default();
    REGISTRY.write().unwrap().register(
        "pool_assigned",
        "Addresses currently bound to pods",
        g.clone(),
    );
    g
});

pub static RETRIES: LazyLock<Family<RetryLabels, Counter>> = LazyLock::new(|| {
    let retries = Family::<RetryLabels, Counter>::default();
    REGISTRY.write().unwrap().register(
        "retries",
        "Retried cloud and orchestrator calls",
        retries.clone(),
    );
    retries
});

pub fn count_retry(op: &str) {
    RETRIES
        .get_or_create(&RetryLabels { op: op.to_string() })
        .inc();
}

pub fn count_rpc(method: &str, success: bool) {
    let status = if success { "ok" } else { "error" };
    RPC_CALLS
        .get_or_create(&RpcLabels {
            method: method.to_string(),
            status: status.to_string(),
        })
        .inc();
}

pub fn observe_rpc_duration(method: &str, seconds: f64) {
    RPC_DURATION
        .get_or_create(&MethodLabels {
            method: method.to_string(),
        })
        .observe(seconds);
}

pub fn set_pool_stats(total: usize, assigned: usize) {
    POOL_TOTAL.set(total as i64);
    POOL_ASSIGNED.set(assigned as i64);
}
