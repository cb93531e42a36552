//! Cascade Scenarios -- curated topologies for the cascade engine.
//!
//! Four preset service layouts with tuned rates and latencies, indexed by a
//! small catalog so runners and demos can pick one by name:
//!
//! - `checkout` -- storefront checkout with gateway, rate limiter,
//!   partitioned order topic, payment workers, and a dead-letter queue.
//! - `cached-reads` -- balanced read path over cache and Redis tiers.
//! - `breaker-shield` -- flaky dependency behind a circuit breaker.
//! - `firehose` -- high-volume broker ingest into object storage.
//!
//! See the `headless_runner` example for a wall-clock driver that runs any
//! catalog entry and logs its snapshots.

pub mod catalog;
pub mod presets;

pub use catalog::{Scenario, all, find};
