//! The simulation engine: owns the service topology and orchestrates the
//! tick pipeline.
//!
//! # Architecture
//!
//! The `Engine` owns:
//! - A validated [`Topology`] (nodes = services, edges = message routes)
//! - Per-node state: a [`Behavior`] and a [`NodeRuntime`] keyed by [`NodeId`]
//! - A [`DeliveryQueue`] of in-flight messages ordered by delivery time
//! - An append-only [`EventLog`] and a [`LifecycleTable`] derived from it
//! - A [`FailureInjector`] holding externally requested fault state
//! - A seeded [`SimRng`] so identical configurations replay identically
//!
//! # Tick Pipeline
//!
//! Each `run_tick()` advances virtual time by one tick and runs:
//! 1. **Failure sync** -- apply crash/recover transitions, consume pending
//!    partition splits, emit latency-spike markers
//! 2. **Node ticks** -- every behavior drains its backlog against its
//!    per-tick budget and routes onward, in topology order
//! 3. **Settle** -- alternate between delivering due messages and reacting
//!    to the events those deliveries produced (dead-letter rerouting,
//!    lifecycle finalization) until a pass makes no progress
//! 4. **Publish** -- emit a metrics snapshot whenever virtual time crosses
//!    the snapshot cadence
//!
//! The engine never sleeps or spawns timers; callers drive it by calling
//! [`Engine::tick`] at whatever real-time pace they like, using
//! [`Engine::tick_interval_ms`] as the suggested pacing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use slotmap::SecondaryMap;

use crate::error::TopologyError;
use crate::event::{EventKind, EventLog, SimEvent};
use crate::fixed::Fixed64;
use crate::id::{MessageId, MessageIdGen, NodeId};
use crate::injector::{FailureInjector, FailureOutcome};
use crate::message::{LifecycleTable, Message, MessageState};
use crate::metrics::{MetricsAggregator, MetricsConfig, SnapshotInputs, SystemSnapshot};
use crate::node::{
    Behavior, BreakerConfig, NodeRuntime, TickCtx, notify_node_crashed, notify_node_recovered,
    receive_message,
};
use crate::publish::{SinkPublisher, SnapshotSink};
use crate::router::DeliveryQueue;
use crate::rng::SimRng;
use crate::topology::{NodeKind, Topology, TopologySpec};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const DEFAULT_TICK_MS: u64 = 100;
const DEFAULT_SNAPSHOT_INTERVAL_MS: u64 = 2_000;
const DEFAULT_SEED: u64 = 0x5EED;

/// Ceiling on settle passes per tick. Dead-letter rerouting converges in
/// two passes; the margin covers same-tick chains through zero-latency
/// forwarders.
const DEFAULT_MAX_DRAIN_PASSES: u32 = 8;

/// External driver pacing never drops below this, regardless of speed.
const MIN_TICK_INTERVAL_MS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Virtual time added per tick.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Virtual-time cadence for snapshot publication; 0 disables it.
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
    #[serde(default = "default_max_drain_passes")]
    pub max_drain_passes: u32,
    /// Seed for all stochastic node behavior and run-id generation.
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}

fn default_snapshot_interval_ms() -> u64 {
    DEFAULT_SNAPSHOT_INTERVAL_MS
}

fn default_max_drain_passes() -> u32 {
    DEFAULT_MAX_DRAIN_PASSES
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            snapshot_interval_ms: DEFAULT_SNAPSHOT_INTERVAL_MS,
            max_drain_passes: DEFAULT_MAX_DRAIN_PASSES,
            seed: DEFAULT_SEED,
            metrics: MetricsConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Whether ticks currently advance the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Paused,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The core simulation engine. Drives the service topology through the
/// tick pipeline under a deterministic virtual clock.
#[derive(Debug)]
pub struct Engine {
    /// The service topology under simulation.
    pub topology: Topology,

    pub(crate) config: EngineConfig,

    // -- Per-node state (SoA, keyed by NodeId) --
    /// Archetype behavior for each node.
    pub(crate) behaviors: SecondaryMap<NodeId, Behavior>,

    /// Shared runtime state (inbox, crashed flag) for each node.
    pub(crate) runtimes: SecondaryMap<NodeId, NodeRuntime>,

    // -- Message flow --
    pub(crate) queue: DeliveryQueue,
    pub(crate) log: EventLog,
    pub(crate) lifecycle: LifecycleTable,

    /// Last known payload per message id, for dead-letter rerouting after
    /// the failing node already consumed the message.
    pub(crate) message_cache: HashMap<MessageId, Message>,

    /// Log index up to which lifecycle reactions have already run.
    scan_cursor: usize,

    // -- Fault state and randomness --
    pub(crate) injector: FailureInjector,
    pub(crate) rng: SimRng,
    pub(crate) ids: MessageIdGen,

    // -- Reporting --
    pub(crate) aggregator: MetricsAggregator,
    pub(crate) publisher: SinkPublisher,
    next_snapshot_at: u64,

    run_id: String,
    now_ms: u64,
    state: RunState,
    speed: Fixed64,
}

impl Engine {
    /// Build an engine over a validated topology.
    pub fn new(spec: &TopologySpec, config: EngineConfig) -> Result<Self, TopologyError> {
        let topology = Topology::build(spec)?;
        let mut rng = SimRng::new(config.seed);
        let run_id = format!("run-{:016x}", rng.next_u64());

        let mut behaviors = SecondaryMap::new();
        let mut runtimes = SecondaryMap::new();
        for &node in topology.order() {
            behaviors.insert(node, Behavior::for_node(&topology, node));
            runtimes.insert(node, NodeRuntime::default());
        }

        let aggregator = MetricsAggregator::new(config.metrics);
        let next_snapshot_at = config.snapshot_interval_ms;
        Ok(Self {
            topology,
            behaviors,
            runtimes,
            queue: DeliveryQueue::new(),
            log: EventLog::new(),
            lifecycle: LifecycleTable::default(),
            message_cache: HashMap::new(),
            scan_cursor: 0,
            injector: FailureInjector::new(),
            rng,
            ids: MessageIdGen::default(),
            aggregator,
            publisher: SinkPublisher::default(),
            next_snapshot_at,
            run_id,
            now_ms: 0,
            state: RunState::Idle,
            speed: Fixed64::ONE,
            config,
        })
    }

    // -----------------------------------------------------------------------
    // Run control
    // -----------------------------------------------------------------------

    /// Begin (or resume) advancing on calls to [`Engine::tick`].
    pub fn start(&mut self) {
        self.state = RunState::Running;
    }

    pub fn pause(&mut self) {
        if self.state == RunState::Running {
            self.state = RunState::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.state == RunState::Paused {
            self.state = RunState::Running;
        }
    }

    /// Advance one tick if running; a no-op while idle or paused.
    pub fn tick(&mut self) {
        if self.state == RunState::Running {
            self.run_tick();
        }
    }

    /// Advance exactly one tick regardless of run state. Useful for
    /// debugging a paused simulation.
    pub fn step(&mut self) {
        self.run_tick();
    }

    /// Rewind to virtual time zero with a freshly seeded RNG. A reset run
    /// with the same configuration replays the identical event stream,
    /// including the run id.
    pub fn reset(&mut self) {
        self.state = RunState::Idle;
        self.now_ms = 0;
        self.rng = SimRng::new(self.config.seed);
        self.run_id = format!("run-{:016x}", self.rng.next_u64());
        self.queue.clear();
        self.log.clear();
        self.lifecycle.clear();
        self.message_cache.clear();
        self.scan_cursor = 0;
        self.ids.reset();
        self.injector.reset();
        self.next_snapshot_at = self.config.snapshot_interval_ms;
        for &node in self.topology.order() {
            self.behaviors
                .insert(node, Behavior::for_node(&self.topology, node));
            self.runtimes.insert(node, NodeRuntime::default());
        }
    }

    /// Set the speed multiplier, clamped to 0.5..=5. Speed only changes the
    /// suggested real-time pacing; virtual time per tick is fixed.
    pub fn set_speed(&mut self, multiplier: Fixed64) {
        self.speed = multiplier
            .max(Fixed64::from_num(0.5))
            .min(Fixed64::from_num(5));
    }

    /// Suggested real-time delay between [`Engine::tick`] calls for the
    /// current speed, floored at 10ms.
    pub fn tick_interval_ms(&self) -> u64 {
        let base = Fixed64::from_num(self.config.tick_ms.min(3_600_000) as u32);
        let scaled = base / self.speed;
        (scaled.int().to_num::<i64>().max(MIN_TICK_INTERVAL_MS as i64)) as u64
    }

    // -----------------------------------------------------------------------
    // Failure injection
    // -----------------------------------------------------------------------

    /// Request a crash; takes effect at the next tick's failure sync.
    pub fn crash_node(&mut self, node: NodeId) {
        self.injector.crash_node(node);
    }

    pub fn recover_node(&mut self, node: NodeId) {
        self.injector.recover_node(node);
    }

    /// Mark a sustained latency spike; emits a marker event every tick
    /// until cleared.
    pub fn inject_latency_spike(&mut self, node: NodeId, spike_ms: u32) {
        self.injector.inject_latency_spike(node, spike_ms);
    }

    pub fn clear_latency_spike(&mut self, node: NodeId) {
        self.injector.clear_latency_spike(node);
    }

    /// Queue a one-shot partition split for a partitioned broker.
    pub fn trigger_partition_split(&mut self, node: NodeId) {
        self.injector.trigger_partition_split(node);
    }

    /// Take replicas of a pooled consumer out of service (0 restores all).
    pub fn set_down_replicas(&mut self, node: NodeId, count: u32) {
        self.injector.set_down_replicas(node, count);
    }

    pub fn injector(&self) -> &FailureInjector {
        &self.injector
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn run_state(&self) -> RunState {
        self.state
    }

    pub fn speed(&self) -> Fixed64 {
        self.speed
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.topology.node_id(name)
    }

    pub fn events(&self) -> &[SimEvent] {
        self.log.all()
    }

    pub fn message_state(&self, id: MessageId) -> MessageState {
        self.lifecycle.state(id)
    }

    /// Messages scheduled but not yet delivered.
    pub fn pending_deliveries(&self) -> usize {
        self.queue.len()
    }

    /// Compute a snapshot of the current window on demand.
    pub fn snapshot(&self) -> SystemSnapshot {
        self.aggregator.compute_snapshot(SnapshotInputs {
            run_id: &self.run_id,
            now_ms: self.now_ms,
            topology: &self.topology,
            behaviors: &self.behaviors,
            runtimes: &self.runtimes,
            log: &self.log,
        })
    }

    /// Register a destination for cadence-published snapshots.
    pub fn add_sink(&mut self, sink: Box<dyn SnapshotSink>) {
        self.publisher.add_sink(sink);
    }

    // -----------------------------------------------------------------------
    // Tick pipeline
    // -----------------------------------------------------------------------

    fn run_tick(&mut self) {
        self.now_ms += self.config.tick_ms;
        self.log.set_time(self.now_ms);

        self.sync_failure_state();
        self.tick_nodes();
        self.settle_deliveries();
        self.maybe_publish();
    }

    /// Reconcile injector fault state with per-node runtime state, emitting
    /// status events for every transition.
    fn sync_failure_state(&mut self) {
        for &node in self.topology.order() {
            let should_crash = self.injector.is_crashed(node);
            let is_crashed = self.runtimes.get(node).is_some_and(|r| r.crashed);

            if should_crash && !is_crashed {
                if let Some(runtime) = self.runtimes.get_mut(node) {
                    runtime.crashed = true;
                }
                self.log.node_crashed(node);
                for (_, behavior) in self.behaviors.iter_mut() {
                    notify_node_crashed(behavior, node);
                }
            } else if !should_crash && is_crashed {
                if let Some(runtime) = self.runtimes.get_mut(node) {
                    runtime.crashed = false;
                }
                self.log.node_recovered(node);
                for (owner, behavior) in self.behaviors.iter_mut() {
                    notify_node_recovered(behavior, &self.topology, owner, node);
                }
            }

            if self.topology.kind(node) == NodeKind::Kafka
                && self.injector.consume_partition_split(node)
            {
                self.log.partition_split(node);
            }

            if let Some(spike_ms) = self.injector.latency_spike(node) {
                self.log.latency_spike(node, Some(spike_ms), true);
            }
        }
    }

    fn tick_nodes(&mut self) {
        let tick_fraction = Fixed64::from_num(self.config.tick_ms.min(3_600_000) as u32)
            / Fixed64::from_num(1000);

        for &node in self.topology.order() {
            let Some(behavior) = self.behaviors.get_mut(node) else {
                continue;
            };
            let Some(runtime) = self.runtimes.get_mut(node) else {
                continue;
            };
            let mut ctx = TickCtx {
                topology: &self.topology,
                lifecycle: &self.lifecycle,
                queue: &mut self.queue,
                log: &mut self.log,
                rng: &mut self.rng,
                ids: &mut self.ids,
                injector: &self.injector,
                breaker: &self.config.breaker,
                now_ms: self.now_ms,
                tick_fraction,
            };
            behavior.tick(runtime, node, &mut ctx);
        }
    }

    /// Alternate between delivering due messages and reacting to the events
    /// they produced, until a full pass makes no progress. Dead-letter
    /// rerouting schedules same-time deliveries, so one tick settles the
    /// whole fail-and-reroute chain.
    fn settle_deliveries(&mut self) {
        for _ in 0..self.config.max_drain_passes.max(1) {
            let drained = self.drain_due_deliveries();
            let reacted = self.scan_new_events();
            if drained == 0 && reacted == 0 {
                break;
            }
        }
    }

    fn drain_due_deliveries(&mut self) -> usize {
        let mut drained = 0;
        while let Some(delivery) = self.queue.pop_due(self.now_ms) {
            drained += 1;

            let target_is_dlq = self.topology.is_dlq(delivery.target);
            if self
                .lifecycle
                .should_skip_delivery(delivery.message.id, target_is_dlq)
            {
                continue;
            }
            self.message_cache
                .insert(delivery.message.id, delivery.message);

            if let Some(outcome) = delivery.forced {
                match outcome {
                    FailureOutcome::Error => self.log.message_error(
                        delivery.from,
                        Some(delivery.target),
                        delivery.message.id,
                        delivery.failure_injected,
                    ),
                    FailureOutcome::Drop => self.log.message_dropped(
                        delivery.from,
                        Some(delivery.target),
                        delivery.message.id,
                        None,
                        delivery.failure_injected,
                    ),
                }
                continue;
            }

            let Some(behavior) = self.behaviors.get_mut(delivery.target) else {
                continue;
            };
            let Some(runtime) = self.runtimes.get_mut(delivery.target) else {
                continue;
            };
            receive_message(
                behavior,
                runtime,
                &mut self.log,
                delivery.target,
                delivery.message,
                delivery.from,
                self.now_ms,
            );
        }
        drained
    }

    /// React to events appended since the last scan: finalize lifecycle on
    /// terminal receives, reroute failures toward a dead-letter queue.
    fn scan_new_events(&mut self) -> usize {
        let fresh: Vec<SimEvent> = self.log.from_seq(self.scan_cursor).to_vec();
        self.scan_cursor = self.log.len();

        for event in &fresh {
            match event.kind {
                EventKind::MessageReceived => self.note_received(event),
                EventKind::MessageError | EventKind::MessageDropped => {
                    self.reroute_failure(event);
                }
                _ => {}
            }
        }
        fresh.len()
    }

    fn note_received(&mut self, event: &SimEvent) {
        let (Some(target), Some(message)) = (event.target, event.message) else {
            return;
        };
        if self.topology.is_dlq(target) {
            self.lifecycle.set(message, MessageState::Dlq);
        } else if self.topology.config(target).sink {
            self.lifecycle.set(message, MessageState::Delivered);
        }
    }

    fn reroute_failure(&mut self, event: &SimEvent) {
        let Some(message_id) = event.message else {
            return;
        };
        if !self.lifecycle.begin_dlq_routing(message_id) {
            return;
        }

        let Some(dlq) = self.pick_dlq_target(event.source) else {
            // Nowhere to send it; finalize in place.
            self.lifecycle.set(message_id, MessageState::Dlq);
            return;
        };

        let message = self
            .message_cache
            .get(&message_id)
            .copied()
            .unwrap_or_else(|| Message::new(message_id, self.now_ms));
        // Same-time delivery, no send event: rerouting is bookkeeping, not
        // traffic.
        self.queue.schedule_outcome(
            self.now_ms,
            message,
            event.source,
            dlq,
            None,
            event.failure_injected,
        );
    }

    /// Dead-letter queues directly downstream of the failing node win;
    /// otherwise fall back to the first dead-letter queue anywhere.
    fn pick_dlq_target(&self, source: NodeId) -> Option<NodeId> {
        self.topology
            .downstream(source)
            .find(|&target| self.topology.is_dlq(target))
            .or_else(|| self.topology.dlq_nodes().first().copied())
    }

    fn maybe_publish(&mut self) {
        if self.config.snapshot_interval_ms == 0 {
            return;
        }
        while self.now_ms >= self.next_snapshot_at {
            let snapshot = self.snapshot();
            self.publisher.publish(&snapshot);
            self.next_snapshot_at += self.config.snapshot_interval_ms;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
