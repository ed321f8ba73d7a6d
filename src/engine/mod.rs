//! Scheduler engine: the execution side of the trigger store.
//!
//! The engine polls the store on a fixed tick, claims due bindings up to
//! its free worker capacity, and runs each claim on its own task. A claim
//! settles into exactly one audit record and one store release, so a crash
//! between claim and release leaves the binding in `Firing` for the next
//! start's recovery pass to re-arm.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditRecord, AuditService, AuditStore, MemoryAuditStore, TaskOutcome};
use crate::consumer::{ConsumerRegistry, TaskProperties};
use crate::core::types::TaskKey;
use crate::events::EventBus;
use crate::store::{StoreError, TaskBinding, TriggerStore};

/// Errors from engine lifecycle operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The trigger store did not respond at startup.
    #[error("trigger store unavailable: {0}")]
    StoreUnavailable(String),

    /// The operation requires a started engine.
    #[error("engine is not running")]
    NotRunning,

    /// Trigger store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Running,
    Paused,
}

/// Result of a pause or resume call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub previous: EngineState,
    pub current: EngineState,
    /// Live bindings at the moment of transition.
    pub total_tasks: u64,
}

/// Point-in-time health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineHealth {
    pub is_started: bool,
    pub is_paused: bool,
    pub total_tasks: u64,
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum concurrently executing tasks.
    pub workers: usize,
    /// How often the store is polled for due bindings.
    pub tick_interval: Duration,
    /// How far past its fire instant a claim may be before it is flagged
    /// as a misfire.
    pub misfire_threshold: Duration,
    /// How long a graceful stop waits for in-flight tasks.
    pub shutdown_timeout: Duration,
    /// Identifier stamped into audit records for attempts run here.
    pub node_id: String,
}

impl EngineConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_misfire_threshold(mut self, threshold: Duration) -> Self {
        self.misfire_threshold = threshold;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            tick_interval: Duration::from_millis(500),
            misfire_threshold: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            node_id: format!("node-{}", Uuid::new_v4().simple()),
        }
    }
}

/// Everything a worker task needs, shared across the tick loop and all
/// in-flight executions.
struct WorkerContext {
    store: Arc<dyn TriggerStore>,
    registry: Arc<ConsumerRegistry>,
    audit: Arc<AuditService>,
    events: Arc<EventBus>,
    config: EngineConfig,
    state: Arc<RwLock<EngineState>>,
    inflight: Arc<RwLock<HashMap<TaskKey, JoinHandle<()>>>>,
    semaphore: Arc<Semaphore>,
}

struct EngineRuntime {
    loop_handle: JoinHandle<()>,
    audit: Arc<AuditService>,
}

/// The scheduler engine.
///
/// Construction is cheap and does nothing; `start` spawns the tick loop
/// and the audit writer, `stop` tears both down.
pub struct SchedulerEngine {
    store: Arc<dyn TriggerStore>,
    registry: Arc<ConsumerRegistry>,
    audit_store: Arc<dyn AuditStore>,
    events: Arc<EventBus>,
    config: EngineConfig,
    state: Arc<RwLock<EngineState>>,
    inflight: Arc<RwLock<HashMap<TaskKey, JoinHandle<()>>>>,
    semaphore: Arc<Semaphore>,
    runtime: StdMutex<Option<EngineRuntime>>,
}

impl SchedulerEngine {
    pub fn new(store: Arc<dyn TriggerStore>, registry: ConsumerRegistry) -> Self {
        let config = EngineConfig::default();
        let semaphore = Arc::new(Semaphore::new(config.workers));
        Self {
            store,
            registry: Arc::new(registry),
            audit_store: Arc::new(MemoryAuditStore::new()),
            events: Arc::new(EventBus::new()),
            config,
            state: Arc::new(RwLock::new(EngineState::Stopped)),
            inflight: Arc::new(RwLock::new(HashMap::new())),
            semaphore,
            runtime: StdMutex::new(None),
        }
    }

    /// Replace the default in-memory audit backend.
    pub fn with_audit_store(mut self, audit_store: Arc<dyn AuditStore>) -> Self {
        self.audit_store = audit_store;
        self
    }

    /// Share an event bus with external subscribers.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.semaphore = Arc::new(Semaphore::new(config.workers));
        self.config = config;
        self
    }

    /// The event bus tasks publish to.
    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    /// Start the tick loop.
    ///
    /// Idempotent: starting a started engine is a no-op. An unreachable
    /// trigger store is fatal and leaves the engine stopped.
    pub async fn start(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.write().await;
            if *state != EngineState::Stopped {
                debug!("engine already started");
                return Ok(());
            }

            self.store
                .ping()
                .await
                .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;

            let recovered = self.store.recover().await?;
            if recovered > 0 {
                info!(recovered, "re-armed bindings left firing by an interrupted run");
            }

            *state = EngineState::Running;
        }

        let audit = Arc::new(AuditService::new(Arc::clone(&self.audit_store)));
        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            audit: Arc::clone(&audit),
            events: Arc::clone(&self.events),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            inflight: Arc::clone(&self.inflight),
            semaphore: Arc::clone(&self.semaphore),
        });

        let loop_handle = tokio::spawn(run_loop(Arc::clone(&ctx)));
        *self.runtime.lock().expect("runtime lock") = Some(EngineRuntime { loop_handle, audit });

        info!(
            workers = self.config.workers,
            node_id = %self.config.node_id,
            "scheduler engine started"
        );
        Ok(())
    }

    /// Stop the engine.
    ///
    /// With `interrupt` false, waits up to the configured shutdown timeout
    /// for in-flight tasks to settle; with `interrupt` true they are
    /// aborted immediately and recovered at the next start.
    pub async fn stop(&self, interrupt: bool) -> Result<(), EngineError> {
        {
            let mut state = self.state.write().await;
            if *state == EngineState::Stopped {
                return Err(EngineError::NotRunning);
            }
            *state = EngineState::Stopped;
        }

        let runtime = self.runtime.lock().expect("runtime lock").take();
        let Some(runtime) = runtime else {
            return Err(EngineError::NotRunning);
        };
        runtime.loop_handle.abort();

        if interrupt {
            let mut inflight = self.inflight.write().await;
            for (key, handle) in inflight.drain() {
                warn!(group_id = %key.group_id, task_id = %key.task_id, "interrupting in-flight task");
                handle.abort();
            }
        } else {
            self.await_inflight().await;
        }

        runtime.audit.drain().await;
        info!("scheduler engine stopped");
        Ok(())
    }

    async fn await_inflight(&self) {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        loop {
            let remaining = {
                let mut inflight = self.inflight.write().await;
                inflight.retain(|_, handle| !handle.is_finished());
                inflight.len()
            };
            if remaining == 0 {
                return;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "shutdown timeout exceeded, aborting in-flight tasks");
                let mut inflight = self.inflight.write().await;
                for (_, handle) in inflight.drain() {
                    handle.abort();
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Suspend claiming. In-flight tasks finish; nothing new fires until
    /// resume.
    pub async fn pause(&self) -> Result<StateTransition, EngineError> {
        self.transition(EngineState::Running, EngineState::Paused)
            .await
    }

    /// Resume claiming after a pause.
    pub async fn resume(&self) -> Result<StateTransition, EngineError> {
        self.transition(EngineState::Paused, EngineState::Running)
            .await
    }

    async fn transition(
        &self,
        from: EngineState,
        to: EngineState,
    ) -> Result<StateTransition, EngineError> {
        let previous = {
            let mut state = self.state.write().await;
            if *state == EngineState::Stopped {
                return Err(EngineError::NotRunning);
            }
            let previous = *state;
            if previous == from {
                *state = to;
            }
            previous
        };
        let current = *self.state.read().await;
        Ok(StateTransition {
            previous,
            current,
            total_tasks: self.store.count().await?,
        })
    }

    pub async fn is_started(&self) -> bool {
        *self.state.read().await != EngineState::Stopped
    }

    pub async fn is_paused(&self) -> bool {
        *self.state.read().await == EngineState::Paused
    }

    /// Live bindings in the store.
    pub async fn total_tasks(&self) -> Result<u64, EngineError> {
        Ok(self.store.count().await?)
    }

    pub async fn health(&self) -> Result<EngineHealth, EngineError> {
        let state = *self.state.read().await;
        Ok(EngineHealth {
            is_started: state != EngineState::Stopped,
            is_paused: state == EngineState::Paused,
            total_tasks: self.store.count().await?,
        })
    }
}

async fn run_loop(ctx: Arc<WorkerContext>) {
    let mut interval = tokio::time::interval(ctx.config.tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let state = *ctx.state.read().await;
        match state {
            EngineState::Stopped => break,
            EngineState::Paused => continue,
            EngineState::Running => {}
        }
        if let Err(e) = tick(&ctx).await {
            error!(error = %e, "tick failed");
        }
    }
}

/// One poll of the store: claim up to the free worker capacity and spawn
/// an execution per claim.
async fn tick(ctx: &Arc<WorkerContext>) -> Result<(), StoreError> {
    {
        let mut inflight = ctx.inflight.write().await;
        inflight.retain(|_, handle| !handle.is_finished());
    }

    let free = ctx.semaphore.available_permits();
    if free == 0 {
        return Ok(());
    }

    let now = chrono::Utc::now();
    let claimed = ctx.store.claim_due(now, free).await?;
    for binding in claimed {
        let permit = match Arc::clone(&ctx.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // Raced out of capacity between the count and the claim;
                // hand the binding back untouched.
                ctx.store
                    .release(&binding.key, Some(binding.next_fire_at), binding.retry)
                    .await?;
                continue;
            }
        };

        let key = binding.key.clone();
        let worker_ctx = Arc::clone(ctx);
        let handle = tokio::spawn(async move {
            execute_claim(worker_ctx, binding).await;
            drop(permit);
        });
        ctx.inflight.write().await.insert(key, handle);
    }
    Ok(())
}

/// Run one claimed binding to settlement: execute the consumer, write the
/// audit record, publish the event line, and release the binding.
async fn execute_claim(ctx: Arc<WorkerContext>, binding: TaskBinding) {
    let now = chrono::Utc::now();
    let fire_time = binding.next_fire_at;
    let lag = (now - fire_time).to_std().unwrap_or(Duration::ZERO);
    let misfire = lag > ctx.config.misfire_threshold;
    if misfire {
        warn!(
            group_id = %binding.key.group_id,
            task_id = %binding.key.task_id,
            lag_ms = lag.as_millis() as u64,
            "misfired trigger, running coalesced attempt"
        );
    }

    let properties = TaskProperties::new(
        binding.key.group_id.clone(),
        binding.key.task_id.clone(),
        fire_time,
        binding.parameters.clone(),
    );

    let started = Instant::now();
    let result = match ctx.registry.resolve(&binding.consumer_type) {
        Ok(runner) => runner.run(properties).await,
        Err(e) => Err(e),
    };
    let run_time_ms = started.elapsed().as_millis() as i64;

    let (outcome, log, detail) = match &result {
        Ok(output) => (TaskOutcome::Success, output.clone(), None),
        Err(e) => (TaskOutcome::Error, None, Some(e.to_string())),
    };

    ctx.audit.record(AuditRecord::new(
        binding.key.group_id.clone(),
        binding.key.task_id.clone(),
        ctx.config.node_id.clone(),
        fire_time,
        run_time_ms,
        outcome,
        log,
        detail.clone(),
        misfire,
    ));

    // One event line per settled attempt, success or failure.
    match &detail {
        None => ctx.events.publish_consumed(
            &binding.consumer_type,
            binding.key.group_id.as_str(),
            binding.key.task_id.as_str(),
        ),
        Some(error) => ctx.events.publish_failed(
            &binding.consumer_type,
            binding.key.group_id.as_str(),
            binding.key.task_id.as_str(),
            error,
        ),
    }

    if let Err(e) = settle(&ctx, binding, result.is_ok()).await {
        error!(error = %e, "failed to release binding after execution");
    }
}

/// Decide the binding's next fire instant after an attempt settles.
///
/// Recurring schedules stay on cadence from now, successful or not; retry
/// backoff only ever reschedules one-shot schedules. Misfired recurring
/// claims land here too, which is what coalesces a backlog of missed
/// occurrences into the single attempt just taken.
async fn settle(
    ctx: &Arc<WorkerContext>,
    binding: TaskBinding,
    succeeded: bool,
) -> Result<(), StoreError> {
    let now = chrono::Utc::now();

    if binding.schedule.is_recurring() {
        let next = match binding.schedule.next_after(now) {
            Ok(Some(next)) => next,
            Ok(None) | Err(_) => {
                warn!(
                    group_id = %binding.key.group_id,
                    task_id = %binding.key.task_id,
                    "recurring schedule yields no next occurrence, removing binding"
                );
                return ctx.store.release(&binding.key, None, binding.retry).await;
            }
        };
        return ctx
            .store
            .release(&binding.key, Some(next), binding.retry.reset())
            .await;
    }

    if succeeded {
        return ctx.store.release(&binding.key, None, binding.retry).await;
    }

    if binding.retry.can_retry() {
        let delay = binding.retry.delay();
        let next = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        debug!(
            group_id = %binding.key.group_id,
            task_id = %binding.key.task_id,
            attempt = binding.retry.attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "retrying failed task"
        );
        ctx.store
            .release(&binding.key, Some(next), binding.retry.next_attempt())
            .await
    } else {
        warn!(
            group_id = %binding.key.group_id,
            task_id = %binding.key.task_id,
            max_attempts = binding.retry.max_attempts,
            "max retries exceeded, removing task"
        );
        ctx.store.release(&binding.key, None, binding.retry).await
    }
}
