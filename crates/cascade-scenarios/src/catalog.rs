//! Named index over the preset topologies.

use cascade_core::topology::TopologySpec;

use crate::presets;

/// One catalog entry: a stable name, a one-line summary, and a builder.
#[derive(Debug, Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub summary: &'static str,
    builder: fn() -> TopologySpec,
}

impl Scenario {
    pub fn build(&self) -> TopologySpec {
        (self.builder)()
    }
}

const CATALOG: &[Scenario] = &[
    Scenario {
        name: "checkout",
        summary: "gateway and rate limiter in front of a partitioned order topic, \
                  payment workers, a durable ledger, and a dead-letter queue",
        builder: presets::checkout_pipeline,
    },
    Scenario {
        name: "cached-reads",
        summary: "balanced read path over an in-process cache and a shared Redis, \
                  backed by relational and wide-column stores",
        builder: presets::cached_read_path,
    },
    Scenario {
        name: "breaker-shield",
        summary: "flaky search dependency behind a circuit breaker with a \
                  dead-letter overflow",
        builder: presets::breaker_shield,
    },
    Scenario {
        name: "firehose",
        summary: "high-volume ingest through a partitioned topic into object \
                  storage, with a RabbitMQ control path",
        builder: presets::broker_firehose,
    },
];

/// Every scenario, in presentation order.
pub fn all() -> &'static [Scenario] {
    CATALOG
}

/// Look a scenario up by its stable name.
pub fn find(name: &str) -> Option<&'static Scenario> {
    CATALOG.iter().find(|s| s.name == name)
}
