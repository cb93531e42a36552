//! Cascade Core -- a discrete-event simulator for message-driven service
//! topologies.
//!
//! This crate models how messages move through a user-described distributed
//! system: producers emit traffic, brokers queue and fan it out, workers
//! process it, stores absorb it, and protective middleware (load balancers,
//! rate limiters, circuit breakers) shapes it. Failures are injected on
//! demand and every consequence is observable through an append-only event
//! log and windowed metrics snapshots.
//!
//! # Tick Pipeline
//!
//! Each call to [`engine::Engine::tick`] advances virtual time by one tick
//! through the following phases:
//!
//! 1. **Failure sync** -- Apply crash/recover transitions and emit markers
//!    for latency spikes and partition splits.
//! 2. **Node ticks** -- Every service drains its backlog against its
//!    per-tick budget and routes output downstream, in topology order.
//! 3. **Settle** -- Deliver due messages and react to the resulting events
//!    (dead-letter rerouting, lifecycle finalization) until quiescent.
//! 4. **Publish** -- Emit a metrics snapshot when virtual time crosses the
//!    snapshot cadence.
//!
//! # Determinism
//!
//! All randomness flows through one seeded [`rng::SimRng`] and all time is
//! virtual, so two engines built from the same spec and configuration
//! produce byte-identical event streams. Fractional arithmetic uses
//! [`fixed::Fixed64`] (Q32.32) rather than floats.
//!
//! # Key Types
//!
//! - [`engine::Engine`] -- Simulation engine and pipeline orchestrator.
//! - [`topology::Topology`] -- Validated service graph with topological
//!   ordering and dead-letter registry.
//! - [`node::Behavior`] -- Seventeen service archetypes, one behavior model
//!   per kind.
//! - [`router::DeliveryQueue`] -- Time-ordered queue of in-flight messages.
//! - [`event::EventLog`] -- Append-only log, the single source of truth for
//!   everything that happened.
//! - [`message::LifecycleTable`] -- Per-message state machine from creation
//!   to delivery, drop, or the dead-letter queue.
//! - [`injector::FailureInjector`] -- Externally requested fault state.
//! - [`metrics::MetricsAggregator`] -- Windowed per-service and system-wide
//!   snapshot computation.
//! - [`publish::SnapshotSink`] -- Destination trait for cadence-published
//!   snapshots.

pub mod engine;
pub mod error;
pub mod event;
pub mod fixed;
pub mod id;
pub mod injector;
pub mod message;
pub mod metrics;
pub mod node;
pub mod publish;
pub mod rng;
pub mod router;
pub mod topology;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
