//! Curated service topologies.
//!
//! Each preset returns a complete [`TopologySpec`] with tuned rates and
//! latencies, ready to hand to [`cascade_core::engine::Engine::new`]. The
//! shapes are drawn from common production layouts: a checkout pipeline, a
//! cached read path, a circuit-breaker shield, and a partitioned broker
//! firehose.

use cascade_core::topology::{EdgeSpec, NodeSpec, TopologySpec};

fn edges(pairs: &[(&str, &str)]) -> Vec<EdgeSpec> {
    pairs
        .iter()
        .enumerate()
        .map(|(i, (source, target))| EdgeSpec {
            id: format!("e{i}"),
            source_id: source.to_string(),
            target_id: target.to_string(),
        })
        .collect()
}

// ===========================================================================
// Checkout pipeline
// ===========================================================================

/// Storefront checkout: gateway and rate limiter in front of a partitioned
/// order topic, a payment worker, and a durable order store. Failed payments
/// land in a dead-letter queue for replay.
pub fn checkout_pipeline() -> TopologySpec {
    let mut storefront = NodeSpec::new("storefront", "producer");
    storefront.label = "Storefront traffic".to_string();
    storefront.throughput_per_sec = Some(40.0);

    let mut gateway = NodeSpec::new("edge-gateway", "api_gateway");
    gateway.throughput_per_sec = Some(120.0);
    gateway.latency_ms = Some(15);
    gateway.timeout_ms = Some(250);

    let mut limiter = NodeSpec::new("checkout-limiter", "rate_limiter");
    limiter.rate_limit_per_sec = Some(60.0);
    limiter.burst_capacity = Some(90.0);

    let mut orders = NodeSpec::new("orders-topic", "kafka");
    orders.partitions = Some(4);
    orders.throughput_per_sec = Some(100.0);
    orders.latency_ms = Some(4);

    let mut payments = NodeSpec::new("payment-worker", "worker");
    payments.replicas = Some(3);
    payments.throughput_per_sec = Some(45.0);
    payments.latency_ms = Some(35);
    payments.failure_rate = Some(0.05);

    let mut ledger = NodeSpec::new("order-ledger", "postgresql");
    ledger.sink = true;
    ledger.latency_ms = Some(12);

    let parked = NodeSpec::new("parked-orders", "dead_letter_queue");

    TopologySpec {
        nodes: vec![storefront, gateway, limiter, orders, payments, ledger, parked],
        edges: edges(&[
            ("storefront", "edge-gateway"),
            ("edge-gateway", "checkout-limiter"),
            ("checkout-limiter", "orders-topic"),
            ("orders-topic", "payment-worker"),
            ("payment-worker", "order-ledger"),
            ("payment-worker", "parked-orders"),
        ]),
    }
}

// ===========================================================================
// Cached read path
// ===========================================================================

/// Read-heavy API: a balancer spreads lookups over two workers, one backed
/// by an in-process cache over a relational store, the other by a shared
/// Redis over a wide-column store. Cache hits terminate at the cache.
pub fn cached_read_path() -> TopologySpec {
    let mut readers = NodeSpec::new("readers", "producer");
    readers.throughput_per_sec = Some(80.0);

    let balancer = NodeSpec::new("read-balancer", "load_balancer");

    let mut catalog_svc = NodeSpec::new("catalog-svc", "worker");
    catalog_svc.throughput_per_sec = Some(60.0);
    catalog_svc.latency_ms = Some(8);

    let mut session_svc = NodeSpec::new("session-svc", "worker");
    session_svc.throughput_per_sec = Some(60.0);
    session_svc.latency_ms = Some(8);

    let mut page_cache = NodeSpec::new("page-cache", "cache");
    page_cache.cache_hit_rate = Some(0.85);
    page_cache.latency_ms = Some(2);

    let mut sessions = NodeSpec::new("session-store", "redis");
    sessions.cache_hit_rate = Some(0.9);
    sessions.throughput_per_sec = Some(150.0);

    let mut catalog_db = NodeSpec::new("catalog-db", "database");
    catalog_db.sink = true;

    let mut profile_db = NodeSpec::new("profile-db", "cassandra");
    profile_db.sink = true;

    TopologySpec {
        nodes: vec![
            readers, balancer, catalog_svc, session_svc, page_cache, sessions, catalog_db,
            profile_db,
        ],
        edges: edges(&[
            ("readers", "read-balancer"),
            ("read-balancer", "catalog-svc"),
            ("read-balancer", "session-svc"),
            ("catalog-svc", "page-cache"),
            ("session-svc", "session-store"),
            ("page-cache", "catalog-db"),
            ("session-store", "profile-db"),
        ]),
    }
}

// ===========================================================================
// Breaker shield
// ===========================================================================

/// A flaky search dependency behind a circuit breaker. The breaker absorbs
/// the dependency's error rate; push the rate past the threshold to watch
/// it trip, shed load, and cool down.
pub fn breaker_shield() -> TopologySpec {
    let mut clients = NodeSpec::new("clients", "producer");
    clients.throughput_per_sec = Some(50.0);

    let mut gateway = NodeSpec::new("search-gateway", "api_gateway");
    gateway.throughput_per_sec = Some(150.0);
    gateway.latency_ms = Some(10);

    let mut shield = NodeSpec::new("search-shield", "circuit_breaker");
    shield.circuit_breaker_threshold = Some(0.5);
    shield.failure_rate = Some(0.15);
    shield.latency_ms = Some(3);

    let mut index = NodeSpec::new("search-index", "elasticsearch");
    index.sink = true;
    index.index_refresh_ms = Some(1_000);

    let overflow = NodeSpec::new("search-overflow", "dead_letter_queue");

    TopologySpec {
        nodes: vec![clients, gateway, shield, index, overflow],
        edges: edges(&[
            ("clients", "search-gateway"),
            ("search-gateway", "search-shield"),
            ("search-shield", "search-index"),
            ("search-shield", "search-overflow"),
        ]),
    }
}

// ===========================================================================
// Broker firehose
// ===========================================================================

/// High-volume ingest: a firehose producer into a partitioned topic drained
/// by a pooled consumer group into object storage, with a parallel RabbitMQ
/// path for low-volume control messages.
pub fn broker_firehose() -> TopologySpec {
    let mut firehose = NodeSpec::new("firehose", "producer");
    firehose.throughput_per_sec = Some(300.0);

    let mut control = NodeSpec::new("control-plane", "producer");
    control.throughput_per_sec = Some(5.0);

    let mut events_topic = NodeSpec::new("events-topic", "kafka");
    events_topic.partitions = Some(6);
    events_topic.throughput_per_sec = Some(400.0);
    events_topic.latency_ms = Some(3);

    let mut control_queue = NodeSpec::new("control-queue", "rabbitmq");
    control_queue.prefetch_count = Some(10);
    control_queue.ack_timeout_ms = Some(200);

    let mut archivers = NodeSpec::new("archiver-pool", "consumer_group");
    archivers.replicas = Some(4);
    archivers.throughput_per_sec = Some(320.0);
    archivers.latency_ms = Some(6);

    let mut ops_worker = NodeSpec::new("ops-worker", "worker");
    ops_worker.throughput_per_sec = Some(20.0);

    let mut archive = NodeSpec::new("cold-archive", "s3");
    archive.sink = true;
    archive.multipart_threshold_mb = Some(16);

    TopologySpec {
        nodes: vec![
            firehose,
            control,
            events_topic,
            control_queue,
            archivers,
            ops_worker,
            archive,
        ],
        edges: edges(&[
            ("firehose", "events-topic"),
            ("events-topic", "archiver-pool"),
            ("archiver-pool", "cold-archive"),
            ("control-plane", "control-queue"),
            ("control-queue", "ops-worker"),
            ("ops-worker", "cold-archive"),
        ]),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::engine::{Engine, EngineConfig};

    fn runs_clean(spec: &TopologySpec) {
        let mut engine = Engine::new(spec, EngineConfig::default()).unwrap();
        engine.start();
        for _ in 0..50 {
            engine.tick();
        }
        let snapshot = engine.snapshot();
        assert!(snapshot.total_throughput > 0.0, "traffic must flow");
        assert!((0.0..=1.0).contains(&snapshot.overall_health_score));
    }

    #[test]
    fn checkout_pipeline_builds_and_flows() {
        runs_clean(&checkout_pipeline());
    }

    #[test]
    fn cached_read_path_builds_and_flows() {
        runs_clean(&cached_read_path());
    }

    #[test]
    fn breaker_shield_builds_and_flows() {
        runs_clean(&breaker_shield());
    }

    #[test]
    fn broker_firehose_builds_and_flows() {
        runs_clean(&broker_firehose());
    }

    #[test]
    fn presets_cover_every_archetype() {
        let mut kinds: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        for spec in [
            checkout_pipeline(),
            cached_read_path(),
            breaker_shield(),
            broker_firehose(),
        ] {
            for node in &spec.nodes {
                kinds.insert(node.kind.clone());
            }
        }
        assert_eq!(kinds.len(), 17, "presets span the archetype roster: {kinds:?}");
    }
}
