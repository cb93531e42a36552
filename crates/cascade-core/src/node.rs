//! Service node behaviors.
//!
//! One [`Behavior`] variant per service archetype, selected once at engine
//! construction and dispatched by enum match each tick (no trait objects).
//! Shared runtime state (inbox, crashed flag) lives in [`NodeRuntime`];
//! archetype-specific state lives inside the variant.
//!
//! Every behavior follows the same budget pattern: a configured per-second
//! throughput becomes a fractional per-tick budget, and the fractional
//! remainder carries across ticks so sub-tick rates still average out
//! instead of rounding to zero forever.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::event::EventLog;
use crate::fixed::{Fixed64, clamp01, split_budget};
use crate::id::{MessageIdGen, NodeId};
use crate::injector::{FailureInjector, FailureOutcome};
use crate::message::{IncomingMessage, LifecycleTable, Message};
use crate::rng::SimRng;
use crate::router::{DeliveryQueue, RouteOptions, route_message};
use crate::topology::{NodeKind, Topology};

/// Messages one replica can process per tick in the worker model.
const PER_REPLICA_THROUGHPUT: u32 = 10;

// ---------------------------------------------------------------------------
// Shared runtime state
// ---------------------------------------------------------------------------

/// Per-node mutable state every archetype shares.
#[derive(Debug, Clone, Default)]
pub struct NodeRuntime {
    pub inbox: VecDeque<IncomingMessage>,
    pub crashed: bool,
}

/// Everything a behavior may touch during one tick. Borrowed from the
/// engine's fields for the duration of the node's turn.
pub struct TickCtx<'a> {
    pub topology: &'a Topology,
    pub lifecycle: &'a LifecycleTable,
    pub queue: &'a mut DeliveryQueue,
    pub log: &'a mut EventLog,
    pub rng: &'a mut SimRng,
    pub ids: &'a mut MessageIdGen,
    pub injector: &'a FailureInjector,
    pub breaker: &'a BreakerConfig,
    pub now_ms: u64,
    /// Tick length as a fraction of one second.
    pub tick_fraction: Fixed64,
}

// ---------------------------------------------------------------------------
// Circuit breaker configuration
// ---------------------------------------------------------------------------

/// Rolling-window and recovery constants for circuit breaker nodes. The
/// defaults are empirical, not load-bearing; runs may tune them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerConfig {
    /// Outcome samples older than this fall out of the error-ratio window.
    #[serde(default = "default_breaker_window_ms")]
    pub window_ms: u64,
    /// Time spent `open` before probing in `half-open`.
    #[serde(default = "default_breaker_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Consecutive `half-open` successes required to close again.
    #[serde(default = "default_half_open_successes")]
    pub half_open_successes: u32,
}

fn default_breaker_window_ms() -> u64 {
    10_000
}

fn default_breaker_cooldown_ms() -> u64 {
    5_000
}

fn default_half_open_successes() -> u32 {
    3
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_ms: default_breaker_window_ms(),
            cooldown_ms: default_breaker_cooldown_ms(),
            half_open_successes: default_half_open_successes(),
        }
    }
}

/// Circuit breaker phase, exposed in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerPhase {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

// ---------------------------------------------------------------------------
// Behavior variants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ProducerState {
    pub carry: Fixed64,
}

#[derive(Debug, Clone)]
pub struct KafkaState {
    /// Per-partition FIFO queues. Assignment is round-robin on receive.
    pub partitions: Vec<VecDeque<Message>>,
    pub next_partition: usize,
    pub carries: Vec<Fixed64>,
}

impl KafkaState {
    fn new(partition_count: usize) -> Self {
        Self {
            partitions: vec![VecDeque::new(); partition_count],
            next_partition: 0,
            carries: vec![Fixed64::ZERO; partition_count],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RabbitmqState {
    pub carry: Fixed64,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerState {
    pub carry: Fixed64,
}

/// Latency and saturation constants for one member of the datastore family.
#[derive(Debug, Clone, Copy)]
pub struct StoreProfile {
    pub base_throughput: Fixed64,
    pub base_failure: Fixed64,
    /// Added failure probability per unit of queue-depth-to-throughput ratio.
    pub load_failure_mult: Fixed64,
    pub failure_cap: Fixed64,
    pub base_latency_ms: u32,
    pub jitter_lo: Fixed64,
    pub jitter_hi: Fixed64,
    pub latency_floor_ms: u32,
    pub latency_ceil_ms: Option<u32>,
    /// Flat overhead, resolved from config at construction.
    pub latency_extra_ms: u32,
}

impl StoreProfile {
    fn database() -> Self {
        Self {
            base_throughput: Fixed64::from_num(20),
            base_failure: Fixed64::from_num(0.02),
            load_failure_mult: Fixed64::from_num(0.2),
            failure_cap: Fixed64::from_num(0.95),
            base_latency_ms: 40,
            jitter_lo: Fixed64::from_num(0.75),
            jitter_hi: Fixed64::from_num(1.5),
            latency_floor_ms: 20,
            latency_ceil_ms: Some(80),
            latency_extra_ms: 0,
        }
    }

    fn postgresql() -> Self {
        Self {
            base_throughput: Fixed64::from_num(24),
            base_failure: Fixed64::from_num(0.02),
            load_failure_mult: Fixed64::from_num(0.12),
            failure_cap: Fixed64::from_num(0.9),
            base_latency_ms: 30,
            jitter_lo: Fixed64::from_num(0.8),
            jitter_hi: Fixed64::from_num(1.5),
            latency_floor_ms: 12,
            latency_ceil_ms: None,
            latency_extra_ms: 0,
        }
    }

    fn cassandra() -> Self {
        Self {
            base_throughput: Fixed64::from_num(65),
            base_failure: Fixed64::from_num(0.01),
            load_failure_mult: Fixed64::from_num(0.05),
            failure_cap: Fixed64::from_num(0.85),
            base_latency_ms: 18,
            jitter_lo: Fixed64::from_num(0.7),
            jitter_hi: Fixed64::from_num(1.3),
            latency_floor_ms: 6,
            latency_ceil_ms: None,
            latency_extra_ms: 0,
        }
    }

    /// Index refresh cadence adds a flat latency term.
    fn elasticsearch(index_refresh_ms: u32) -> Self {
        Self {
            base_throughput: Fixed64::from_num(45),
            base_failure: Fixed64::from_num(0.01),
            load_failure_mult: Fixed64::from_num(0.1),
            failure_cap: Fixed64::from_num(0.8),
            base_latency_ms: 22,
            jitter_lo: Fixed64::from_num(0.8),
            jitter_hi: Fixed64::from_num(1.4),
            latency_floor_ms: 5,
            latency_ceil_ms: None,
            latency_extra_ms: index_refresh_ms / 1000,
        }
    }

    /// Object store: flat failure rate, multipart overhead on latency.
    fn s3(multipart_threshold_mb: u32) -> Self {
        Self {
            base_throughput: Fixed64::from_num(15),
            base_failure: Fixed64::from_num(0.005),
            load_failure_mult: Fixed64::ZERO,
            failure_cap: Fixed64::from_num(0.5),
            base_latency_ms: 90,
            jitter_lo: Fixed64::from_num(0.85),
            jitter_hi: Fixed64::from_num(1.65),
            latency_floor_ms: 20,
            latency_ceil_ms: None,
            latency_extra_ms: multipart_threshold_mb / 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreState {
    pub profile: StoreProfile,
    pub carry: Fixed64,
}

impl StoreState {
    fn new(profile: StoreProfile) -> Self {
        Self {
            profile,
            carry: Fixed64::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RedisState {
    pub carry: Fixed64,
}

#[derive(Debug, Clone, Default)]
pub struct GatewayState {
    pub carry: Fixed64,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimiterState {
    pub tokens: Fixed64,
    /// None until the first tick seeds the bucket at burst capacity.
    pub last_refill_ms: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct LoadBalancerState {
    /// Healthy downstream targets in insertion order.
    pub healthy: Vec<NodeId>,
    pub rr_index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerState {
    pub phase: BreakerPhase,
    pub changed_at_ms: u64,
    /// Recent call outcomes as (virtual time, ok) samples.
    pub window: VecDeque<(u64, bool)>,
    pub half_open_successes: u32,
}

impl CircuitBreakerState {
    fn transition(&mut self, next: BreakerPhase, node: NodeId, now_ms: u64, log: &mut EventLog) {
        if self.phase == next {
            return;
        }
        self.phase = next;
        self.changed_at_ms = now_ms;
        // Transitions surface on the timeline as a latency-spike marker
        // without a magnitude, so they never skew latency aggregates.
        log.latency_spike(node, None, false);
    }

    fn error_ratio(&self) -> Fixed64 {
        if self.window.is_empty() {
            return Fixed64::ZERO;
        }
        let errors = self.window.iter().filter(|(_, ok)| !ok).count();
        Fixed64::from_num(errors as u32) / Fixed64::from_num(self.window.len() as u32)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsumerGroupState {
    pub carry: Fixed64,
    /// Backlog left undrained at the end of the last tick.
    pub lag: u64,
}

/// Archetype dispatch table. One variant per behavior model; several node
/// kinds share the datastore model through a [`StoreProfile`].
#[derive(Debug, Clone)]
pub enum Behavior {
    Producer(ProducerState),
    Kafka(KafkaState),
    Rabbitmq(RabbitmqState),
    Worker(WorkerState),
    Store(StoreState),
    Cache,
    Redis(RedisState),
    Gateway(GatewayState),
    RateLimiter(RateLimiterState),
    LoadBalancer(LoadBalancerState),
    CircuitBreaker(CircuitBreakerState),
    DeadLetter,
    ConsumerGroup(ConsumerGroupState),
}

impl Behavior {
    /// Select and initialize the behavior model for a node.
    pub fn for_node(topology: &Topology, node: NodeId) -> Self {
        let config = topology.config(node);
        match topology.kind(node) {
            NodeKind::Producer => Behavior::Producer(ProducerState::default()),
            NodeKind::Kafka => {
                let partitions = config.partitions.unwrap_or(3).max(1) as usize;
                Behavior::Kafka(KafkaState::new(partitions))
            }
            NodeKind::Rabbitmq => Behavior::Rabbitmq(RabbitmqState::default()),
            NodeKind::Worker => Behavior::Worker(WorkerState::default()),
            NodeKind::Database => Behavior::Store(StoreState::new(StoreProfile::database())),
            NodeKind::Postgresql => Behavior::Store(StoreState::new(StoreProfile::postgresql())),
            NodeKind::Cassandra => Behavior::Store(StoreState::new(StoreProfile::cassandra())),
            NodeKind::Elasticsearch => Behavior::Store(StoreState::new(
                StoreProfile::elasticsearch(config.index_refresh_ms.unwrap_or(1000)),
            )),
            NodeKind::S3 => Behavior::Store(StoreState::new(StoreProfile::s3(
                config.multipart_threshold_mb.unwrap_or(16),
            ))),
            NodeKind::Cache => Behavior::Cache,
            NodeKind::Redis => Behavior::Redis(RedisState::default()),
            NodeKind::LoadBalancer => Behavior::LoadBalancer(LoadBalancerState {
                healthy: topology.downstream(node).collect(),
                rr_index: 0,
            }),
            NodeKind::ApiGateway => Behavior::Gateway(GatewayState::default()),
            NodeKind::RateLimiter => Behavior::RateLimiter(RateLimiterState::default()),
            NodeKind::CircuitBreaker => {
                Behavior::CircuitBreaker(CircuitBreakerState::default())
            }
            NodeKind::DeadLetterQueue => Behavior::DeadLetter,
            NodeKind::ConsumerGroup => Behavior::ConsumerGroup(ConsumerGroupState::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared receive path
// ---------------------------------------------------------------------------

/// Deliver a drained message into a node. A crashed node refuses it and the
/// drop is attributed to the sender; otherwise the message is queued and a
/// receive event is recorded. Partitioned brokers assign round-robin here.
pub fn receive_message(
    behavior: &mut Behavior,
    runtime: &mut NodeRuntime,
    log: &mut EventLog,
    target: NodeId,
    message: Message,
    from: NodeId,
    received_at_ms: u64,
) {
    if runtime.crashed {
        log.message_dropped(from, Some(target), message.id, None, true);
        return;
    }

    match behavior {
        Behavior::Kafka(state) => {
            let slot = state.next_partition;
            state.next_partition = (state.next_partition + 1) % state.partitions.len();
            state.partitions[slot].push_back(message);
        }
        _ => {
            runtime.inbox.push_back(IncomingMessage {
                message,
                from,
                received_at_ms,
            });
        }
    }
    log.message_received(from, target, message.id);
}

/// Backlog visible to metrics. Partitioned brokers report the sum of their
/// partition queues; everything else reports the shared inbox.
pub fn queue_depth(behavior: &Behavior, runtime: &NodeRuntime) -> usize {
    match behavior {
        Behavior::Kafka(state) => state.partitions.iter().map(VecDeque::len).sum(),
        _ => runtime.inbox.len(),
    }
}

pub fn breaker_phase(behavior: &Behavior) -> Option<BreakerPhase> {
    match behavior {
        Behavior::CircuitBreaker(state) => Some(state.phase),
        _ => None,
    }
}

pub fn consumer_lag(behavior: &Behavior) -> Option<u64> {
    match behavior {
        Behavior::ConsumerGroup(state) => Some(state.lag),
        _ => None,
    }
}

/// Crash notification for behaviors that track peer health.
pub fn notify_node_crashed(behavior: &mut Behavior, crashed: NodeId) {
    if let Behavior::LoadBalancer(state) = behavior {
        state.healthy.retain(|target| *target != crashed);
    }
}

/// Recovery notification. Only nodes that are actually downstream of the
/// owner rejoin its healthy set.
pub fn notify_node_recovered(
    behavior: &mut Behavior,
    topology: &Topology,
    owner: NodeId,
    recovered: NodeId,
) {
    if let Behavior::LoadBalancer(state) = behavior
        && topology.downstream(owner).any(|target| target == recovered)
        && !state.healthy.contains(&recovered)
    {
        state.healthy.push(recovered);
    }
}

// ---------------------------------------------------------------------------
// Tick dispatch
// ---------------------------------------------------------------------------

impl Behavior {
    /// Advance this node by one tick. Crashed nodes hold all traffic.
    pub fn tick(&mut self, runtime: &mut NodeRuntime, node: NodeId, ctx: &mut TickCtx<'_>) {
        if runtime.crashed {
            return;
        }
        match self {
            Behavior::Producer(state) => tick_producer(state, node, ctx),
            Behavior::Kafka(state) => tick_kafka(state, node, ctx),
            Behavior::Rabbitmq(state) => tick_rabbitmq(state, runtime, node, ctx),
            Behavior::Worker(state) => tick_worker(state, runtime, node, ctx),
            Behavior::Store(state) => tick_store(state, runtime, node, ctx),
            Behavior::Cache => tick_cache(runtime, node, ctx),
            Behavior::Redis(state) => tick_redis(state, runtime, node, ctx),
            Behavior::Gateway(state) => tick_gateway(state, runtime, node, ctx),
            Behavior::RateLimiter(state) => tick_rate_limiter(state, runtime, node, ctx),
            Behavior::LoadBalancer(state) => tick_load_balancer(state, runtime, node, ctx),
            Behavior::CircuitBreaker(state) => tick_circuit_breaker(state, runtime, node, ctx),
            Behavior::DeadLetter => {}
            Behavior::ConsumerGroup(state) => tick_consumer_group(state, runtime, node, ctx),
        }
    }
}

/// Route out of `node` and record one send event if anything was scheduled.
fn send_from(
    ctx: &mut TickCtx<'_>,
    node: NodeId,
    message: Message,
    latency_ms: u32,
    only_targets: Option<&[NodeId]>,
) -> u32 {
    let fanout = route_message(
        ctx.topology,
        ctx.lifecycle,
        ctx.queue,
        ctx.now_ms,
        node,
        message,
        RouteOptions {
            latency_ms,
            only_targets,
            ..RouteOptions::default()
        },
    );
    if fanout > 0 {
        ctx.log.message_sent(node, message.id, latency_ms);
    }
    fanout
}

fn round_ms(value: Fixed64) -> u32 {
    value.round().to_num::<i64>().max(0) as u32
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

fn tick_producer(state: &mut ProducerState, node: NodeId, ctx: &mut TickCtx<'_>) {
    let config = ctx.topology.config(node);
    let throughput = config.throughput_per_sec.unwrap_or(Fixed64::ONE);
    let latency_ms = config.latency_ms.unwrap_or(0);

    let budget = throughput * ctx.tick_fraction + state.carry;
    let (to_produce, carry) = split_budget(budget);
    state.carry = carry;

    for _ in 0..to_produce {
        let message = Message::new(ctx.ids.next_id(), ctx.now_ms);
        send_from(ctx, node, message, latency_ms, None);
    }
}

// ---------------------------------------------------------------------------
// Partitioned broker
// ---------------------------------------------------------------------------

fn tick_kafka(state: &mut KafkaState, node: NodeId, ctx: &mut TickCtx<'_>) {
    let config = ctx.topology.config(node);
    let throughput = config.throughput_per_sec.unwrap_or(Fixed64::from_num(50));
    let latency_ms = config.latency_ms.unwrap_or(5);
    let partition_rate = throughput / Fixed64::from_num(state.partitions.len() as u32);

    for slot in 0..state.partitions.len() {
        let budget = partition_rate * ctx.tick_fraction + state.carries[slot];
        let (to_process, carry) = split_budget(budget);
        state.carries[slot] = carry;

        for _ in 0..to_process {
            let Some(message) = state.partitions[slot].pop_front() else {
                break;
            };
            send_from(ctx, node, message, latency_ms, None);
        }
    }
}

// ---------------------------------------------------------------------------
// Queue broker with prefetch and ack timeout
// ---------------------------------------------------------------------------

fn tick_rabbitmq(
    state: &mut RabbitmqState,
    runtime: &mut NodeRuntime,
    node: NodeId,
    ctx: &mut TickCtx<'_>,
) {
    let config = ctx.topology.config(node);
    let throughput = config.throughput_per_sec.unwrap_or(Fixed64::from_num(80));
    let prefetch = config.prefetch_count.unwrap_or(20).max(1);
    let ack_timeout_ms = config.ack_timeout_ms.unwrap_or(200);
    let base_latency = config.latency_ms.unwrap_or(8);

    let budget = throughput * ctx.tick_fraction + state.carry;
    let (whole, carry) = split_budget(budget);
    // Only the fractional remainder carries; budget capped away by prefetch
    // is forfeited.
    state.carry = carry;
    let to_process = whole.min(prefetch);

    for _ in 0..to_process {
        let Some(incoming) = runtime.inbox.pop_front() else {
            break;
        };
        let jitter = ctx.rng.jitter(Fixed64::from_num(0.8), Fixed64::from_num(1.2));
        let latency = round_ms(Fixed64::from_num(base_latency) * jitter).max(2);
        if latency > ack_timeout_ms {
            ctx.log.message_dropped(
                node,
                Some(incoming.from),
                incoming.message.id,
                Some(latency),
                false,
            );
            continue;
        }
        send_from(ctx, node, incoming.message, latency, None);
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

fn tick_worker(
    state: &mut WorkerState,
    runtime: &mut NodeRuntime,
    node: NodeId,
    ctx: &mut TickCtx<'_>,
) {
    let config = ctx.topology.config(node);
    let replicas = config.replicas.unwrap_or(1).max(1);
    let throughput = config
        .throughput_per_sec
        .unwrap_or_else(|| Fixed64::from_num(replicas * PER_REPLICA_THROUGHPUT));
    let base_latency = config.latency_ms.unwrap_or(30);
    let failure_rate = clamp01(config.failure_rate.unwrap_or(Fixed64::ZERO));

    let budget = throughput * ctx.tick_fraction + state.carry;
    let (limit, carry) = split_budget(budget);
    state.carry = carry;
    let to_process = limit
        .min(runtime.inbox.len() as u32)
        .min(replicas * PER_REPLICA_THROUGHPUT);

    for _ in 0..to_process {
        let Some(incoming) = runtime.inbox.pop_front() else {
            break;
        };
        match FailureInjector::roll_outcome(failure_rate, ctx.rng) {
            Some(FailureOutcome::Error) => {
                ctx.log
                    .message_error(node, Some(incoming.from), incoming.message.id, false);
            }
            Some(FailureOutcome::Drop) => {
                ctx.log
                    .message_dropped(node, Some(incoming.from), incoming.message.id, None, false);
            }
            None => {
                let jitter = ctx.rng.jitter(Fixed64::from_num(0.8), Fixed64::from_num(1.2));
                let latency = round_ms(Fixed64::from_num(base_latency) * jitter);
                send_from(ctx, node, incoming.message, latency, None);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Datastore family
// ---------------------------------------------------------------------------

fn tick_store(
    state: &mut StoreState,
    runtime: &mut NodeRuntime,
    node: NodeId,
    ctx: &mut TickCtx<'_>,
) {
    let config = ctx.topology.config(node);
    let profile = state.profile;
    let throughput = config.throughput_per_sec.unwrap_or(profile.base_throughput);
    let base_latency = config.latency_ms.unwrap_or(profile.base_latency_ms);
    let base_failure = config.failure_rate.unwrap_or(profile.base_failure);

    let budget = throughput * ctx.tick_fraction + state.carry;
    let (to_process, carry) = split_budget(budget);
    state.carry = carry;

    for _ in 0..to_process {
        let Some(incoming) = runtime.inbox.pop_front() else {
            break;
        };

        // Saturation raises the failure rate with the remaining backlog.
        let load = Fixed64::from_num(runtime.inbox.len() as u32)
            / throughput.max(Fixed64::ONE);
        let rate = (base_failure + load * profile.load_failure_mult).min(profile.failure_cap);
        match FailureInjector::roll_outcome(rate, ctx.rng) {
            Some(FailureOutcome::Error) => {
                ctx.log
                    .message_error(node, Some(incoming.from), incoming.message.id, false);
                continue;
            }
            Some(FailureOutcome::Drop) => {
                ctx.log
                    .message_dropped(node, Some(incoming.from), incoming.message.id, None, false);
                continue;
            }
            None => {}
        }

        let jitter = ctx.rng.jitter(profile.jitter_lo, profile.jitter_hi);
        let mut latency = round_ms(Fixed64::from_num(base_latency) * jitter)
            + profile.latency_extra_ms;
        latency = latency.max(profile.latency_floor_ms);
        if let Some(ceil) = profile.latency_ceil_ms {
            latency = latency.min(ceil);
        }
        send_from(ctx, node, incoming.message, latency, None);
    }
}

// ---------------------------------------------------------------------------
// Caches
// ---------------------------------------------------------------------------

fn tick_cache(runtime: &mut NodeRuntime, node: NodeId, ctx: &mut TickCtx<'_>) {
    let config = ctx.topology.config(node);
    let hit_rate = clamp01(config.cache_hit_rate.unwrap_or(Fixed64::from_num(0.7)));
    let miss_latency = config.latency_ms.unwrap_or(5);

    let pending = runtime.inbox.len();
    for _ in 0..pending {
        let Some(incoming) = runtime.inbox.pop_front() else {
            break;
        };
        if ctx.rng.chance(hit_rate) {
            // Hit served locally; downstream never sees it.
            continue;
        }
        send_from(ctx, node, incoming.message, miss_latency, None);
    }
}

fn tick_redis(
    state: &mut RedisState,
    runtime: &mut NodeRuntime,
    node: NodeId,
    ctx: &mut TickCtx<'_>,
) {
    let config = ctx.topology.config(node);
    let throughput = config.throughput_per_sec.unwrap_or(Fixed64::from_num(120));
    let hit_rate = clamp01(config.cache_hit_rate.unwrap_or(Fixed64::from_num(0.8)));
    let miss_latency = config.latency_ms.unwrap_or(6);

    let budget = throughput * ctx.tick_fraction + state.carry;
    let (to_process, carry) = split_budget(budget);
    state.carry = carry;

    for _ in 0..to_process {
        let Some(incoming) = runtime.inbox.pop_front() else {
            break;
        };
        // Inline tier: hits bias latency down but still forward.
        let latency = if ctx.rng.chance(hit_rate) {
            1 + ctx.rng.next_range(3)
        } else {
            miss_latency
        };
        send_from(ctx, node, incoming.message, latency, None);
    }
}

// ---------------------------------------------------------------------------
// Gateway admission control
// ---------------------------------------------------------------------------

fn tick_gateway(
    state: &mut GatewayState,
    runtime: &mut NodeRuntime,
    node: NodeId,
    ctx: &mut TickCtx<'_>,
) {
    let config = ctx.topology.config(node);
    let throughput = config
        .throughput_per_sec
        .unwrap_or(Fixed64::from_num(100))
        .max(Fixed64::ONE);
    let latency = config.latency_ms.unwrap_or(20);
    let timeout_ms = config.timeout_ms.unwrap_or(250);

    let budget = throughput * ctx.tick_fraction + state.carry;
    let (capacity, carry) = split_budget(budget);
    state.carry = carry;

    let mut processed = 0;
    while let Some(incoming) = runtime.inbox.pop_front() {
        if processed >= capacity {
            // Shed: over-capacity traffic is refused, not queued.
            ctx.log
                .message_dropped(node, Some(incoming.from), incoming.message.id, None, false);
            continue;
        }
        processed += 1;

        if latency > timeout_ms {
            ctx.log.message_dropped(
                node,
                Some(incoming.from),
                incoming.message.id,
                Some(latency),
                false,
            );
            continue;
        }
        send_from(ctx, node, incoming.message, latency, None);
    }
}

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

fn tick_rate_limiter(
    state: &mut RateLimiterState,
    runtime: &mut NodeRuntime,
    node: NodeId,
    ctx: &mut TickCtx<'_>,
) {
    let config = ctx.topology.config(node);
    let rate = config
        .rate_limit_per_sec
        .or(config.throughput_per_sec)
        .unwrap_or(Fixed64::from_num(20))
        .max(Fixed64::ONE);
    let burst = config.burst_capacity.unwrap_or(rate).max(Fixed64::ONE);
    let latency = config.latency_ms.unwrap_or(1);

    let last_refill = match state.last_refill_ms {
        Some(at) => at,
        None => {
            state.tokens = burst;
            ctx.now_ms
        }
    };
    // Divide before multiplying so long idle gaps cannot overflow the
    // fixed-point range; anything past an hour fully refills the bucket.
    let elapsed_ms = ctx.now_ms.saturating_sub(last_refill).min(3_600_000);
    let elapsed_s = Fixed64::from_num(elapsed_ms as u32) / Fixed64::from_num(1000);
    state.tokens = (state.tokens + rate * elapsed_s).min(burst);
    state.last_refill_ms = Some(ctx.now_ms);

    let pending = runtime.inbox.len();
    for _ in 0..pending {
        let Some(incoming) = runtime.inbox.pop_front() else {
            break;
        };
        if state.tokens < Fixed64::ONE {
            ctx.log
                .message_dropped(node, Some(incoming.from), incoming.message.id, None, false);
            continue;
        }
        state.tokens -= Fixed64::ONE;
        send_from(ctx, node, incoming.message, latency, None);
    }
}

// ---------------------------------------------------------------------------
// Load balancer
// ---------------------------------------------------------------------------

fn tick_load_balancer(
    state: &mut LoadBalancerState,
    runtime: &mut NodeRuntime,
    node: NodeId,
    ctx: &mut TickCtx<'_>,
) {
    let latency = ctx.topology.config(node).latency_ms.unwrap_or(2);

    if state.healthy.is_empty() {
        // No live target: shed the whole backlog instead of queuing forever.
        while let Some(incoming) = runtime.inbox.pop_front() {
            ctx.log
                .message_dropped(node, Some(incoming.from), incoming.message.id, None, false);
        }
        return;
    }

    let pending = runtime.inbox.len();
    for _ in 0..pending {
        let Some(incoming) = runtime.inbox.pop_front() else {
            break;
        };
        let target = state.healthy[state.rr_index % state.healthy.len()];
        state.rr_index += 1;
        send_from(ctx, node, incoming.message, latency, Some(&[target]));
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

fn tick_circuit_breaker(
    state: &mut CircuitBreakerState,
    runtime: &mut NodeRuntime,
    node: NodeId,
    ctx: &mut TickCtx<'_>,
) {
    let config = ctx.topology.config(node);
    let failure_rate = clamp01(config.failure_rate.unwrap_or(Fixed64::ZERO));
    let threshold = config
        .circuit_breaker_threshold
        .unwrap_or(Fixed64::from_num(0.5));
    let latency = config.latency_ms.unwrap_or(2);

    while let Some(&(at, _)) = state.window.front() {
        if ctx.now_ms.saturating_sub(at) > ctx.breaker.window_ms {
            state.window.pop_front();
        } else {
            break;
        }
    }

    if state.phase == BreakerPhase::Open
        && ctx.now_ms.saturating_sub(state.changed_at_ms) >= ctx.breaker.cooldown_ms
    {
        state.transition(BreakerPhase::HalfOpen, node, ctx.now_ms, ctx.log);
    }

    let pending = runtime.inbox.len();
    for _ in 0..pending {
        let Some(incoming) = runtime.inbox.pop_front() else {
            break;
        };

        if state.phase == BreakerPhase::Open {
            ctx.log
                .message_error(node, Some(incoming.from), incoming.message.id, false);
            continue;
        }

        let failed = ctx.rng.chance(failure_rate);
        state.window.push_back((ctx.now_ms, !failed));

        if state.phase == BreakerPhase::HalfOpen {
            if failed {
                state.transition(BreakerPhase::Open, node, ctx.now_ms, ctx.log);
                state.half_open_successes = 0;
                ctx.log
                    .message_error(node, Some(incoming.from), incoming.message.id, false);
                continue;
            }
            state.half_open_successes += 1;
            if state.half_open_successes >= ctx.breaker.half_open_successes {
                state.transition(BreakerPhase::Closed, node, ctx.now_ms, ctx.log);
                state.half_open_successes = 0;
            }
        }

        if state.phase == BreakerPhase::Closed && state.error_ratio() > threshold {
            // The message that tips the ratio is itself rejected.
            state.transition(BreakerPhase::Open, node, ctx.now_ms, ctx.log);
            ctx.log
                .message_error(node, Some(incoming.from), incoming.message.id, false);
            continue;
        }

        if failed {
            ctx.log
                .message_error(node, Some(incoming.from), incoming.message.id, false);
            continue;
        }
        send_from(ctx, node, incoming.message, latency, None);
    }
}

// ---------------------------------------------------------------------------
// Consumer group
// ---------------------------------------------------------------------------

fn tick_consumer_group(
    state: &mut ConsumerGroupState,
    runtime: &mut NodeRuntime,
    node: NodeId,
    ctx: &mut TickCtx<'_>,
) {
    let config = ctx.topology.config(node);
    let replicas = config.replicas.unwrap_or(1).max(1);
    let down = ctx.injector.down_replicas(node);
    let active = replicas.saturating_sub(down).max(1);
    let throughput = config
        .throughput_per_sec
        .unwrap_or_else(|| Fixed64::from_num(replicas * PER_REPLICA_THROUGHPUT));
    let latency = config.latency_ms.unwrap_or(10);

    let scaled =
        throughput * Fixed64::from_num(active) / Fixed64::from_num(replicas);
    let budget = scaled * ctx.tick_fraction + state.carry;
    let (to_process, carry) = split_budget(budget);
    state.carry = carry;

    for _ in 0..to_process {
        let Some(incoming) = runtime.inbox.pop_front() else {
            break;
        };
        send_from(ctx, node, incoming.message, latency, None);
    }

    state.lag = runtime.inbox.len() as u64;
}

// ===========================================================================
// Tests
// ===========================================================================
