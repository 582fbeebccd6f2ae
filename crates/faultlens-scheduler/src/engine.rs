//! Analysis Scheduler — decides whether a signal starts or resumes a workflow and
//! drives every workflow step through the execution pipeline.
//!
//! ```text
//! start(agent, target, signal)
//!   ├── interested workflow ─┬─ ready to accept ──► dispatch (resume)
//!   │                        └─ busy / backlog ──► pending-signal queue
//!   └── none ── eligible? ──► create workflow ───► dispatch
//!
//! activation loop (every activation_interval)
//!   ├── timer past deadline ──────────────► dispatch (DoAnalysis)
//!   └── waiting on a signal + queued one ─► dispatch with that signal
//!
//! dispatch ──► ExecutionPipeline ──► step ──► persist, notify, drop terminal record
//! ```
//!
//! Schedule records live in an in-memory working set written through to the
//! persistent store. The in-use guard exists only in the working set.

use std::any::Any;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use faultlens_core::{
    FaultLensError, Result, SchedulerConfig, SourceEvent, TargetEntity, TriggerSignal,
};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{AgentId, AgentKind, StopOptions};
use crate::continuation::Continuation;
use crate::interest::InterestPredicate;
use crate::notify::{ConsumeOption, ConsumerRouter, Notification, WorkflowConsumer};
use crate::pipeline::{ExecutionPipeline, PipelineStats};
use crate::registry::AgentRegistry;
use crate::schedule::{ActivationCandidate, RecoveryOutcome, ScheduleRecord, ScheduleStatus};
use crate::store::SchedulerStores;
use crate::workflow::{AnalysisWorkflow, WorkflowOutcome, WorkflowResult};

/// What `start` did with a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new workflow was created and dispatched.
    Created(Uuid),
    /// A suspended workflow was resumed with the signal.
    Resumed(Uuid),
    /// Queued for a workflow that cannot take it yet.
    Queued(Uuid),
    /// No workflow was interested and the agent declined the signal.
    NotEligible,
}

/// Agent entry point a step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepKind {
    Analyze,
    Update,
}

impl StepKind {
    fn for_resume(continuation: Option<&Continuation>) -> Self {
        match continuation {
            Some(Continuation::WaitForInterest) => StepKind::Update,
            _ => StepKind::Analyze,
        }
    }
}

/// Counts from startup reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub restored: usize,
    pub resumed: usize,
    pub exhausted: usize,
    pub pending_signals: usize,
    /// Workflow bodies removed by retention.
    pub pruned: usize,
}

/// The workflow scheduler. Cheap to clone; clones share one instance.
#[derive(Clone)]
pub struct AnalysisScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    registry: AgentRegistry,
    stores: SchedulerStores,
    records: DashMap<Uuid, ScheduleRecord>,
    pending: DashMap<Uuid, VecDeque<TriggerSignal>>,
    pipeline: ExecutionPipeline,
    consumers: ConsumerRouter,
    cancel: CancellationToken,
    activation_loop: Mutex<Option<JoinHandle<()>>>,
    recovery: RecoveryReport,
}

impl AnalysisScheduler {
    /// Build the scheduler and reconcile state left by a previous run.
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: SchedulerConfig,
        registry: AgentRegistry,
        stores: SchedulerStores,
    ) -> Result<Self> {
        if !(1..=3).contains(&config.max_attempts) {
            return Err(FaultLensError::invalid_argument(format!(
                "max_attempts must be in [1, 3], got {}",
                config.max_attempts
            )));
        }
        let cancel = CancellationToken::new();
        let pipeline = ExecutionPipeline::new(
            config.queue_capacity,
            config.max_parallelism,
            cancel.child_token(),
        )?;

        let mut inner = Inner {
            config,
            registry,
            stores,
            records: DashMap::new(),
            pending: DashMap::new(),
            pipeline,
            consumers: ConsumerRouter::new(),
            cancel,
            activation_loop: Mutex::new(None),
            recovery: RecoveryReport::default(),
        };
        match inner.recover() {
            Ok(report) => inner.recovery = report,
            Err(e) => {
                inner.cancel.cancel();
                return Err(e);
            }
        }

        tracing::info!(
            "🔭 Analysis scheduler ready: {} agents, {} workflows, {} queued signals",
            inner.registry.count(),
            inner.records.len(),
            inner.recovery.pending_signals
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Route a trigger signal to an interested workflow, or start a new one.
    pub async fn start(
        &self,
        agent_id: &AgentId,
        target: TargetEntity,
        signal: TriggerSignal,
    ) -> Result<StartOutcome> {
        self.inner.start(agent_id, target, signal).await
    }

    /// Bootstrap the workflow of a time-triggered agent for `target`. Returns the
    /// existing workflow if one is still live.
    pub async fn schedule_periodic(&self, agent_id: &AgentId, target: TargetEntity) -> Result<Uuid> {
        self.inner.schedule_periodic(agent_id, target).await
    }

    /// Run one activation pass. Returns how many workflows were resumed.
    pub async fn run_activation_pass(&self) -> Result<usize> {
        self.inner.run_activation_pass().await
    }

    /// Start the background activation loop. Only one may run per scheduler.
    pub fn spawn_activation_loop(&self) -> Result<()> {
        let mut slot = self
            .inner
            .activation_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(FaultLensError::invalid_argument(
                "activation loop is already running",
            ));
        }
        let inner = Arc::clone(&self.inner);
        *slot = Some(tokio::spawn(inner.run_activation_loop()));
        Ok(())
    }

    /// Forward `Stop` to every live agent; `RemoveAllState` also wipes all stores.
    pub async fn stop(&self, options: StopOptions) -> Result<()> {
        for agent in self.inner.registry.instantiated() {
            if let Err(e) = agent.stop(options).await {
                tracing::warn!("⚠️ Agent {} failed to stop: {}", agent.id(), e);
            }
        }
        if options == StopOptions::RemoveAllState {
            self.inner.stores.clear_all()?;
            self.inner.records.clear();
            self.inner.pending.clear();
            tracing::info!("🧹 All scheduler state removed");
        }
        Ok(())
    }

    /// Ask every live agent to reload its configuration. Returns how many succeeded.
    pub async fn reload_agent_configuration(&self) -> usize {
        let mut reloaded = 0;
        for agent in self.inner.registry.instantiated() {
            match agent.reload_configuration().await {
                Ok(()) => reloaded += 1,
                Err(e) => tracing::warn!("⚠️ Agent {} failed to reload: {}", agent.id(), e),
            }
        }
        tracing::info!("🔄 Reloaded configuration of {} agent(s)", reloaded);
        reloaded
    }

    /// Apply the workflow-body retention policy now.
    pub fn prune_expired(&self) -> Result<usize> {
        self.inner.prune_expired()
    }

    pub fn add_consumer(
        &self,
        agent_id: AgentId,
        consumer: Arc<dyn WorkflowConsumer>,
        option: ConsumeOption,
    ) {
        self.inner.consumers.add_consumer(agent_id, consumer, option);
    }

    /// Cancel everything and wait for the loop and the pipeline workers to exit.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handle = self
            .inner
            .activation_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.pipeline.shutdown().await;
        tracing::info!("🛑 Analysis scheduler stopped");
    }

    // ─── Accessors ──────────────────────────────────────

    pub fn schedule_record(&self, workflow_id: Uuid) -> Option<ScheduleRecord> {
        self.inner.records.get(&workflow_id).map(|r| r.value().clone())
    }

    /// All live schedule records, oldest first.
    pub fn schedule_records(&self) -> Vec<ScheduleRecord> {
        let mut records: Vec<_> = self.inner.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn workflow(&self, workflow_id: Uuid) -> Result<Option<AnalysisWorkflow>> {
        self.inner.stores.workflows.get(&workflow_id)
    }

    pub fn pending_signals(&self, workflow_id: Uuid) -> Vec<TriggerSignal> {
        self.inner
            .pending
            .get(&workflow_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.inner.pipeline.stats()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.consumers.history()
    }

    pub fn recovery_report(&self) -> RecoveryReport {
        self.inner.recovery
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

impl Inner {
    // ─── Recovery ──────────────────────────────────────

    fn recover(&self) -> Result<RecoveryReport> {
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        for (id, queue) in self.stores.pending.get_all()? {
            report.pending_signals += queue.len();
            self.pending.insert(id, queue);
        }

        for (id, mut record) in self.stores.records.snapshot()? {
            if record.status.is_terminal() {
                self.settle_terminal(id, record.status)?;
                continue;
            }
            if record.status.is_interrupted() {
                match record.recover_for_resume(now)? {
                    RecoveryOutcome::Resumable => {
                        tracing::info!(
                            "♻️ Workflow {} interrupted, resuming (attempt {}/{})",
                            id,
                            record.scheduling.attempts,
                            record.scheduling.max_attempts
                        );
                        self.stores.records.persist(&id, &record)?;
                        report.resumed += 1;
                    }
                    RecoveryOutcome::Exhausted => {
                        self.fail_exhausted(id, now)?;
                        report.exhausted += 1;
                        continue;
                    }
                }
            }
            self.records.insert(id, record);
            report.restored += 1;
        }

        report.pruned = self.prune_expired()?;
        Ok(report)
    }

    /// Finish the cleanup of a workflow whose terminal record outlived a crash.
    /// The step already ran, so it is neither re-run nor re-notified.
    fn settle_terminal(&self, id: Uuid, status: ScheduleStatus) -> Result<()> {
        tracing::info!("🧹 Workflow {} ended {} before the restart, removing its record", id, status);
        if let Some(mut workflow) = self.stores.workflows.get(&id)? {
            if !workflow.status.is_terminal() {
                workflow.status = status;
                self.stores.workflows.persist(&id, &workflow)?;
            }
        }
        self.stores.records.delete(&id)?;
        self.drop_pending(id)
    }

    fn fail_exhausted(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        tracing::warn!("❌ Workflow {} out of attempts after interrupted runs", id);
        if let Some(mut workflow) = self.stores.workflows.get(&id)? {
            workflow.record_exception("attempts exhausted after interrupted runs", now);
            workflow.status = ScheduleStatus::Failed;
            self.stores.workflows.persist(&id, &workflow)?;
        }
        self.stores.records.delete(&id)?;
        self.drop_pending(id)
    }

    /// Retention applies only to bodies of ended workflows; a live record pins its body.
    fn prune_expired(&self) -> Result<usize> {
        let live: HashSet<Uuid> = self.records.iter().map(|r| *r.key()).collect();
        let pruned = self
            .stores
            .workflows
            .prune_expired(Utc::now(), |id| live.contains(id))?;
        if pruned > 0 {
            tracing::info!("🗑️ Pruned {} expired workflow bodies", pruned);
        }
        Ok(pruned)
    }

    // ─── Start ──────────────────────────────────────

    async fn start(
        self: &Arc<Self>,
        agent_id: &AgentId,
        target: TargetEntity,
        signal: TriggerSignal,
    ) -> Result<StartOutcome> {
        self.pipeline.ensure_healthy()?;

        if let Some(workflow) = self.find_interested(agent_id, &signal.event)? {
            return self.deliver(workflow, target, signal).await;
        }

        let agent = self.registry.get_or_create(agent_id)?;
        if !agent.is_eligible_for_analysis(&target, &signal) {
            tracing::debug!("Signal {} not eligible for {}", signal.event.label(), agent_id);
            return Ok(StartOutcome::NotEligible);
        }

        let mut workflow = agent.create_new_workflow(&signal)?;
        if workflow.agent_id != *agent_id {
            return Err(FaultLensError::invalid_argument(format!(
                "agent {} created a workflow owned by {}",
                agent_id, workflow.agent_id
            )));
        }
        let id = workflow.id;
        tracing::info!(
            "🆕 Workflow {} created by {} for {} on {}",
            id,
            agent_id,
            signal.event.label(),
            target
        );
        workflow.target = Some(target);
        workflow.attach_signal(signal);
        self.claim_new(&workflow)?;
        self.dispatch(workflow, StepKind::Analyze).await?;
        Ok(StartOutcome::Created(id))
    }

    /// Linear scan for the oldest live workflow of `agent_id` whose interest matches.
    fn find_interested(
        &self,
        agent_id: &AgentId,
        event: &SourceEvent,
    ) -> Result<Option<AnalysisWorkflow>> {
        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = self
            .records
            .iter()
            .filter(|r| !r.status.is_terminal() && r.has_registered_interest)
            .map(|r| (r.created_at, *r.key()))
            .collect();
        candidates.sort();

        for (_, id) in candidates {
            let Some(workflow) = self.stores.workflows.get(&id)? else {
                continue;
            };
            if workflow.agent_id != *agent_id {
                continue;
            }
            if workflow
                .interest
                .as_ref()
                .is_some_and(|interest| interest.is_match(event))
            {
                return Ok(Some(workflow));
            }
        }
        Ok(None)
    }

    /// Hand `signal` to an interested workflow: resume it now or queue the signal.
    ///
    /// Readiness is checked and then claimed, so a concurrent caller can win the
    /// claim in between; the loser queues and the activation loop delivers later.
    async fn deliver(
        self: &Arc<Self>,
        workflow: AnalysisWorkflow,
        target: TargetEntity,
        signal: TriggerSignal,
    ) -> Result<StartOutcome> {
        let id = workflow.id;
        if let Some(existing) = &workflow.target {
            if *existing != target {
                return Err(FaultLensError::TargetMismatch {
                    workflow_id: id,
                    expected: existing.to_string(),
                    actual: target.to_string(),
                });
            }
        }
        if workflow.has_processed(&signal.event) || self.is_queued(id, &signal.event) {
            return Err(duplicate(id, &signal.event));
        }

        let claimed = if self.has_backlog(id) {
            None
        } else {
            self.try_claim(id, ScheduleRecord::is_ready_to_accept_signal)?
        };
        let Some(kind) = claimed else {
            self.enqueue(id, signal)?;
            return Ok(StartOutcome::Queued(id));
        };

        // Reload under the claim; the scanned copy may predate the last step.
        let Some(mut workflow) = self.load_claimed(id)? else {
            return Err(FaultLensError::storage(format!(
                "workflow {id} has no stored body"
            )));
        };
        if workflow.has_processed(&signal.event) {
            self.release(id);
            return Err(duplicate(id, &signal.event));
        }
        if workflow.target.is_none() {
            workflow.target = Some(target);
        }
        tracing::debug!("▶️ Resuming workflow {} with {}", id, signal.event.label());
        workflow.attach_signal(signal);
        self.dispatch(workflow, kind).await?;
        Ok(StartOutcome::Resumed(id))
    }

    async fn schedule_periodic(
        self: &Arc<Self>,
        agent_id: &AgentId,
        target: TargetEntity,
    ) -> Result<Uuid> {
        let agent = self.registry.get_or_create(agent_id)?;
        if agent.kind() != AgentKind::TimeTriggered {
            return Err(FaultLensError::invalid_argument(format!(
                "agent {agent_id} is not time-triggered"
            )));
        }
        if let Some(existing) = self.find_live(agent_id, &target)? {
            tracing::debug!("Periodic workflow {} already live for {}", existing, target);
            return Ok(existing);
        }

        let signal = TriggerSignal::periodic(target.clone());
        let mut workflow = agent.create_new_workflow(&signal)?;
        let id = workflow.id;
        tracing::info!("📅 Periodic workflow {} scheduled for {} on {}", id, agent_id, target);
        workflow.target = Some(target);
        workflow.attach_signal(signal);
        self.claim_new(&workflow)?;
        self.dispatch(workflow, StepKind::Analyze).await?;
        Ok(id)
    }

    fn find_live(&self, agent_id: &AgentId, target: &TargetEntity) -> Result<Option<Uuid>> {
        let ids: Vec<Uuid> = self
            .records
            .iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| *r.key())
            .collect();
        for id in ids {
            if let Some(workflow) = self.stores.workflows.get(&id)? {
                if workflow.agent_id == *agent_id && workflow.target.as_ref() == Some(target) {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    // ─── Claims and the pending-signal cache ──────────────────────────────────────

    /// Create (or reuse) the record of a new workflow and claim it.
    fn claim_new(&self, workflow: &AnalysisWorkflow) -> Result<()> {
        let id = workflow.id;
        let record = self
            .stores
            .records
            .get_or_add(&id, || ScheduleRecord::new(id, self.config.max_attempts))?;
        let mut entry = self.records.entry(id).or_insert(record);
        entry.start_use()
    }

    /// Claim the record if `ready` holds for it. Returns the step to run.
    fn try_claim(
        &self,
        id: Uuid,
        ready: impl Fn(&ScheduleRecord) -> bool,
    ) -> Result<Option<StepKind>> {
        let Some(mut record) = self.records.get_mut(&id) else {
            return Ok(None);
        };
        if !ready(&record) {
            return Ok(None);
        }
        record.start_use()?;
        Ok(Some(StepKind::for_resume(record.continuation())))
    }

    fn release(&self, id: Uuid) {
        if let Some(mut record) = self.records.get_mut(&id) {
            record.stop_use();
        }
    }

    /// Load the body of a claimed workflow; a missing body drops the record.
    fn load_claimed(&self, id: Uuid) -> Result<Option<AnalysisWorkflow>> {
        match self.stores.workflows.get(&id) {
            Ok(Some(workflow)) => Ok(Some(workflow)),
            Ok(None) => {
                tracing::warn!("🗑️ Workflow {} has no body, dropping its schedule record", id);
                self.forget(id)?;
                Ok(None)
            }
            Err(e) => {
                self.release(id);
                Err(e)
            }
        }
    }

    fn is_queued(&self, id: Uuid, event: &SourceEvent) -> bool {
        self.pending
            .get(&id)
            .is_some_and(|q| q.iter().any(|s| s.event == *event))
    }

    fn has_backlog(&self, id: Uuid) -> bool {
        self.pending.get(&id).is_some_and(|q| !q.is_empty())
    }

    fn enqueue(&self, id: Uuid, signal: TriggerSignal) -> Result<()> {
        let mut queue = self.pending.entry(id).or_default();
        if queue.iter().any(|s| s.event == signal.event) {
            return Err(duplicate(id, &signal.event));
        }
        tracing::debug!(
            "📬 Signal {} queued for workflow {} (depth {})",
            signal.event.label(),
            id,
            queue.len() + 1
        );
        queue.push_back(signal);
        self.stores.pending.set(&id, &queue)
    }

    /// Pop the next queued signal the workflow has not processed yet.
    fn take_pending(&self, id: Uuid, workflow: &AnalysisWorkflow) -> Result<Option<TriggerSignal>> {
        let (next, empty) = {
            let Some(mut queue) = self.pending.get_mut(&id) else {
                return Ok(None);
            };
            let mut next = None;
            while let Some(signal) = queue.pop_front() {
                if workflow.has_processed(&signal.event) {
                    tracing::debug!("Dropping already processed signal {}", signal.event.label());
                    continue;
                }
                next = Some(signal);
                break;
            }
            self.stores.pending.set(&id, &queue)?;
            (next, queue.is_empty())
        };
        if empty {
            self.pending.remove_if(&id, |_, q| q.is_empty());
        }
        Ok(next)
    }

    fn drop_pending(&self, id: Uuid) -> Result<()> {
        self.pending.remove(&id);
        self.stores.pending.set(&id, &VecDeque::new())
    }

    /// Remove every trace of a workflow's scheduling state. The body stays.
    fn forget(&self, id: Uuid) -> Result<()> {
        self.records.remove(&id);
        self.stores.records.delete(&id)?;
        self.drop_pending(id)
    }

    // ─── Dispatch and execution ──────────────────────────────────────

    /// Queue one step of a claimed workflow. The claim is released on failure.
    async fn dispatch(self: &Arc<Self>, mut workflow: AnalysisWorkflow, kind: StepKind) -> Result<()> {
        let id = workflow.id;
        if let Err(e) = self.prepare_dispatch(&mut workflow) {
            self.release(id);
            return Err(e);
        }
        let inner = Arc::clone(self);
        let job = async move { inner.execute_step(workflow, kind).await }.boxed();
        if let Err(e) = self.pipeline.submit(id, job).await {
            self.release(id);
            return Err(e);
        }
        Ok(())
    }

    fn prepare_dispatch(&self, workflow: &mut AnalysisWorkflow) -> Result<()> {
        self.pipeline.ensure_healthy()?;
        let id = workflow.id;
        let status = {
            let mut record = self
                .records
                .get_mut(&id)
                .ok_or_else(|| FaultLensError::storage(format!("no schedule record for {id}")))?;
            if workflow.interest.is_some() {
                record.has_registered_interest = true;
            }
            record.mark_queued()?;
            self.stores.records.persist(&id, &record)?;
            record.status
        };
        workflow.status = status;
        self.stores.workflows.persist(&id, workflow)
    }

    async fn execute_step(self: Arc<Self>, mut workflow: AnalysisWorkflow, kind: StepKind) -> Result<()> {
        let id = workflow.id;
        let status = match self.begin_step(id, Utc::now()) {
            Ok(Some(status)) => status,
            Ok(None) => {
                tracing::debug!("Workflow {} was removed before its step ran", id);
                return Ok(());
            }
            Err(e) => {
                self.release(id);
                return Err(e);
            }
        };
        workflow.status = status;
        let step_number = workflow.advance_progress();
        tracing::debug!(
            "⚙️ Workflow {} step {} ({:?}) on {}",
            id,
            step_number,
            kind,
            workflow.target_label()
        );

        let step = self.run_agent(&mut workflow, kind).await;
        self.finish_step(workflow, step).await
    }

    /// Pre-step bookkeeping: Queued → InProgress and persist the invocation time.
    fn begin_step(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<ScheduleStatus>> {
        let Some(mut record) = self.records.get_mut(&id) else {
            return Ok(None);
        };
        record.mark_started(now)?;
        self.stores.records.persist(&id, &record)?;
        Ok(Some(record.status))
    }

    /// Run the agent, turning errors and panics into a failure message.
    async fn run_agent(
        &self,
        workflow: &mut AnalysisWorkflow,
        kind: StepKind,
    ) -> std::result::Result<Continuation, String> {
        let agent = self
            .registry
            .get_or_create(&workflow.agent_id)
            .map_err(|e| e.to_string())?;
        let cancel = &self.cancel;
        let call = async {
            match kind {
                StepKind::Analyze => agent.do_analysis(workflow, cancel).await,
                StepKind::Update => agent.update_analysis(workflow, cancel).await,
            }
        };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(continuation)) => Ok(continuation),
            Ok(Err(e)) => Err(e.to_string()),
            Err(payload) => Err(format!("agent panicked: {}", panic_message(payload.as_ref()))),
        }
    }

    /// Post-step bookkeeping, then re-raise a captured failure.
    async fn finish_step(
        &self,
        mut workflow: AnalysisWorkflow,
        step: std::result::Result<Continuation, String>,
    ) -> Result<()> {
        let id = workflow.id;
        let now = Utc::now();
        match &step {
            Ok(continuation) => register_implicit_interest(&mut workflow, continuation),
            Err(message) => {
                tracing::warn!("⚠️ Workflow {} step failed: {}", id, message);
                workflow.record_exception(message.clone(), now);
            }
        }

        let status = {
            let Some(mut record) = self.records.get_mut(&id) else {
                tracing::debug!("Workflow {} was removed during its step", id);
                return Ok(());
            };
            let applied = match &step {
                Ok(continuation) => record.set_continuation(continuation.clone(), now),
                Err(_) => record.mark_failed(now),
            };
            record.has_registered_interest = workflow.interest.is_some();
            record.stop_use();
            applied?;
            // Written even when terminal; recovery settles it via `settle_terminal`.
            self.stores.records.persist(&id, &record)?;
            record.status
        };
        workflow.status = status;
        self.stores.workflows.persist(&id, &workflow)?;

        if status.is_terminal() {
            let outcome = if status == ScheduleStatus::Completed {
                WorkflowOutcome::Finished
            } else {
                WorkflowOutcome::Failed
            };
            let label = workflow.target_label();
            let result = WorkflowResult::new(workflow, outcome);
            self.consumers.notify(&result, &self.cancel).await;
            self.forget(id)?;
            tracing::info!("🏁 Workflow {} {:?} on {}", id, outcome, label);
        } else if let Ok(continuation) = &step {
            tracing::debug!("💤 Workflow {} suspended: {}", id, continuation);
        }

        match step {
            Ok(_) => Ok(()),
            Err(message) => Err(FaultLensError::StepFailed {
                workflow_id: id,
                message,
            }),
        }
    }

    // ─── Activation ──────────────────────────────────────

    async fn run_activation_loop(self: Arc<Self>) {
        let period = self.config.activation_interval().max(Duration::from_millis(1));
        tracing::info!("⏰ Activation loop started (every {}ms)", period.as_millis());
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.run_activation_pass().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!("🔔 Activation pass resumed {} workflow(s)", n),
                Err(e) if e.is_fatal() || matches!(e, FaultLensError::Cancelled) => {
                    tracing::error!("💥 Activation loop halted: {}", e);
                    break;
                }
                Err(e) => tracing::warn!("⚠️ Activation pass failed: {}", e),
            }
        }
        tracing::info!("⏰ Activation loop stopped");
    }

    async fn run_activation_pass(self: &Arc<Self>) -> Result<usize> {
        self.pipeline.ensure_healthy()?;
        let now = Utc::now();
        let mut heap: BinaryHeap<ActivationCandidate> = self
            .records
            .iter()
            .map(|r| ActivationCandidate(r.value().clone()))
            .collect();

        let mut resumed = 0;
        while let Some(ActivationCandidate(record)) = heap.pop() {
            if record.in_use() || record.status.is_terminal() || !record.has_attempts_remaining() {
                continue;
            }
            let id = record.workflow_id;
            let attempt = match record.continuation() {
                Some(Continuation::WaitForTime(_)) if record.is_due(now) => {
                    self.resume_due(id, now).await
                }
                Some(c) if c.waits_for_signal() && self.has_backlog(id) => {
                    self.resume_from_backlog(id).await
                }
                _ => Ok(false),
            };
            match attempt {
                Ok(true) => resumed += 1,
                Ok(false) => {}
                Err(e) if e.is_fatal() || matches!(e, FaultLensError::Cancelled) => return Err(e),
                Err(e) => tracing::warn!("⚠️ Could not resume workflow {}: {}", id, e),
            }
        }
        Ok(resumed)
    }

    async fn resume_due(self: &Arc<Self>, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let Some(kind) = self.try_claim(id, |r| r.is_due(now) && !r.in_use())? else {
            return Ok(false);
        };
        let Some(workflow) = self.load_claimed(id)? else {
            return Ok(false);
        };
        tracing::debug!("⏰ Timer elapsed for workflow {}", id);
        self.dispatch(workflow, kind).await?;
        Ok(true)
    }

    async fn resume_from_backlog(self: &Arc<Self>, id: Uuid) -> Result<bool> {
        let Some(kind) = self.try_claim(id, ScheduleRecord::is_ready_to_accept_signal)? else {
            return Ok(false);
        };
        let Some(mut workflow) = self.load_claimed(id)? else {
            return Ok(false);
        };
        let next = match self.take_pending(id, &workflow) {
            Ok(next) => next,
            Err(e) => {
                self.release(id);
                return Err(e);
            }
        };
        let Some(signal) = next else {
            self.release(id);
            return Ok(false);
        };
        tracing::debug!("📨 Delivering queued {} to workflow {}", signal.event.label(), id);
        workflow.attach_signal(signal);
        self.dispatch(workflow, kind).await?;
        Ok(true)
    }
}

/// Event-style directives imply an interest when the workflow registered none.
fn register_implicit_interest(workflow: &mut AnalysisWorkflow, continuation: &Continuation) {
    if workflow.interest.is_some() {
        return;
    }
    let interest = match continuation {
        Continuation::WaitForFabricEvent(event) => InterestPredicate::for_event(event.clone()),
        Continuation::WaitForScenario(scenario) => {
            let target_id = workflow
                .target
                .as_ref()
                .unwrap_or(&TargetEntity::Cluster)
                .entity_id();
            InterestPredicate::for_scenario(*scenario, target_id)
        }
        Continuation::WaitForInterest => {
            tracing::warn!(
                "Workflow {} waits for interest without registering one",
                workflow.id
            );
            return;
        }
        Continuation::Done | Continuation::WaitForTime(_) => return,
    };
    workflow.register_interest(interest);
}

fn duplicate(id: Uuid, event: &SourceEvent) -> FaultLensError {
    FaultLensError::DuplicateSignal {
        workflow_id: id,
        event: event.label(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::store::{
        MemoryBackend, PersistentStore, RetentionPolicy, SCHEDULE_RECORDS, StoreBackend,
        WORKFLOW_BODIES,
    };
    use async_trait::async_trait;
    use faultlens_core::Scenario;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    type StepFn = Box<dyn Fn(&mut AnalysisWorkflow) -> Result<Continuation> + Send + Sync>;

    struct TestAgent {
        id: &'static str,
        kind: AgentKind,
        analyze: StepFn,
        update: StepFn,
        only: Option<Scenario>,
        gate: Option<CancellationToken>,
        analyze_calls: AtomicUsize,
        update_calls: AtomicUsize,
        analyze_times: Mutex<Vec<Instant>>,
        updated_with: Mutex<Vec<SourceEvent>>,
        stops: AtomicUsize,
        reloads: AtomicUsize,
    }

    impl TestAgent {
        fn new(
            id: &'static str,
            analyze: impl Fn(&mut AnalysisWorkflow) -> Result<Continuation> + Send + Sync + 'static,
        ) -> Self {
            Self {
                id,
                kind: AgentKind::SignalTriggered,
                analyze: Box::new(analyze),
                update: Box::new(|_| Ok(Continuation::done())),
                only: None,
                gate: None,
                analyze_calls: AtomicUsize::new(0),
                update_calls: AtomicUsize::new(0),
                analyze_times: Mutex::new(Vec::new()),
                updated_with: Mutex::new(Vec::new()),
                stops: AtomicUsize::new(0),
                reloads: AtomicUsize::new(0),
            }
        }

        fn with_update(
            mut self,
            update: impl Fn(&mut AnalysisWorkflow) -> Result<Continuation> + Send + Sync + 'static,
        ) -> Self {
            self.update = Box::new(update);
            self
        }

        fn eligible_for(mut self, scenario: Scenario) -> Self {
            self.only = Some(scenario);
            self
        }

        fn gated(mut self, gate: CancellationToken) -> Self {
            self.gate = Some(gate);
            self
        }

        fn time_triggered(mut self) -> Self {
            self.kind = AgentKind::TimeTriggered;
            self
        }

        fn analyze_calls(&self) -> usize {
            self.analyze_calls.load(Ordering::SeqCst)
        }

        fn update_calls(&self) -> usize {
            self.update_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Agent for TestAgent {
        fn id(&self) -> AgentId {
            AgentId::new(self.id)
        }

        fn kind(&self) -> AgentKind {
            self.kind
        }

        fn is_eligible_for_analysis(&self, _target: &TargetEntity, signal: &TriggerSignal) -> bool {
            self.only.is_none_or(|s| s == signal.event.scenario)
        }

        async fn do_analysis(
            &self,
            workflow: &mut AnalysisWorkflow,
            _cancel: &CancellationToken,
        ) -> Result<Continuation> {
            self.analyze_times.lock().unwrap().push(Instant::now());
            self.analyze_calls.fetch_add(1, Ordering::SeqCst);
            (self.analyze)(workflow)
        }

        async fn update_analysis(
            &self,
            workflow: &mut AnalysisWorkflow,
            _cancel: &CancellationToken,
        ) -> Result<Continuation> {
            if let Some(gate) = &self.gate {
                gate.cancelled().await;
            }
            if let Some(signal) = &workflow.current_invocation {
                self.updated_with.lock().unwrap().push(signal.event.clone());
            }
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            (self.update)(workflow)
        }

        async fn stop(&self, _options: StopOptions) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reload_configuration(&self) -> Result<()> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Recorder {
        results: Mutex<Vec<WorkflowResult>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.results.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl WorkflowConsumer for Recorder {
        async fn consume(&self, result: &WorkflowResult, _cancel: &CancellationToken) -> Result<()> {
            self.results.lock().unwrap().push(result.clone());
            Ok(())
        }
    }

    /// Captures the persisted schedule record at the moment a result is consumed.
    struct StoredRecordAtNotify {
        records: PersistentStore<ScheduleRecord>,
        seen: Mutex<Vec<Option<ScheduleStatus>>>,
    }

    #[async_trait]
    impl WorkflowConsumer for StoredRecordAtNotify {
        async fn consume(&self, result: &WorkflowResult, _cancel: &CancellationToken) -> Result<()> {
            let stored = self.records.get(&result.workflow.id)?.map(|r| r.status);
            self.seen.lock().unwrap().push(stored);
            Ok(())
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            activation_interval_ms: 50,
            ..SchedulerConfig::default()
        }
    }

    fn scheduler_with(agent: Arc<TestAgent>, stores: SchedulerStores) -> AnalysisScheduler {
        let registry = AgentRegistry::new();
        registry.register_instance(agent);
        AnalysisScheduler::new(fast_config(), registry, stores).unwrap()
    }

    fn signal(scenario: Scenario, target_id: &str, seq: u32) -> TriggerSignal {
        let event = SourceEvent::new("FM", scenario, target_id, Utc::now())
            .with_detail("seq", seq.to_string());
        TriggerSignal::new(event, TargetEntity::Cluster)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn created(outcome: StartOutcome) -> Uuid {
        match outcome {
            StartOutcome::Created(id) => id,
            other => panic!("expected a new workflow, got {other:?}"),
        }
    }

    fn interest_agent(id: &'static str) -> TestAgent {
        TestAgent::new(id, |wf| {
            wf.register_interest(InterestPredicate::for_scenario(Scenario::Reconfiguration, "P"));
            Ok(Continuation::wait_for_interest())
        })
        .eligible_for(Scenario::PrimaryMove)
    }

    #[tokio::test]
    async fn test_resume_after_waits_for_deadline() {
        let delay = Duration::from_millis(600);
        let agent = Arc::new(TestAgent::new("timer", move |wf| {
            Ok(if wf.progress == 1 {
                Continuation::resume_after(delay)
            } else {
                Continuation::done()
            })
        }));
        let scheduler = scheduler_with(agent.clone(), SchedulerStores::in_memory());
        scheduler.spawn_activation_loop().unwrap();

        let id = created(
            scheduler
                .start(&AgentId::new("timer"), TargetEntity::Cluster, signal(Scenario::NodeDown, "N1", 1))
                .await
                .unwrap(),
        );
        wait_until(|| agent.analyze_calls() == 1).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(agent.analyze_calls(), 1, "resumed before the deadline");

        wait_until(|| agent.analyze_calls() == 2).await;
        let times = agent.analyze_times.lock().unwrap().clone();
        let gap = times[1] - times[0];
        assert!(gap >= delay, "gap {gap:?} shorter than {delay:?}");
        assert!(gap < delay + Duration::from_millis(1000), "gap {gap:?} too long");

        wait_until(|| scheduler.schedule_record(id).is_none()).await;
        let wf = scheduler.workflow(id).unwrap().unwrap();
        assert_eq!(wf.status, ScheduleStatus::Completed);
        assert_eq!(wf.progress, 2);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_interest_resumes_exactly_once() {
        let gate = CancellationToken::new();
        let agent = Arc::new(interest_agent("reconfig").gated(gate.clone()));
        let scheduler = scheduler_with(agent.clone(), SchedulerStores::in_memory());
        let agent_id = AgentId::new("reconfig");

        let id = created(
            scheduler
                .start(&agent_id, TargetEntity::Cluster, signal(Scenario::PrimaryMove, "P", 1))
                .await
                .unwrap(),
        );
        wait_until(|| {
            scheduler
                .schedule_record(id)
                .is_some_and(|r| r.is_ready_to_accept_signal())
        })
        .await;
        assert!(scheduler.schedule_record(id).unwrap().has_registered_interest);

        // Another partition does not match the predicate.
        let other = scheduler
            .start(&agent_id, TargetEntity::Cluster, signal(Scenario::Reconfiguration, "Q", 2))
            .await
            .unwrap();
        assert_eq!(other, StartOutcome::NotEligible);

        let wanted = signal(Scenario::Reconfiguration, "P", 3);
        let first = scheduler
            .start(&agent_id, TargetEntity::Cluster, wanted.clone())
            .await
            .unwrap();
        assert_eq!(first, StartOutcome::Resumed(id));
        // The update is still running, so the record is live and the repeat is caught.
        let second = scheduler
            .start(&agent_id, TargetEntity::Cluster, wanted.clone())
            .await;
        assert!(matches!(second, Err(FaultLensError::DuplicateSignal { .. })));
        assert!(scheduler.pending_signals(id).is_empty());

        gate.cancel();
        wait_until(|| scheduler.schedule_record(id).is_none()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(agent.update_calls(), 1);
        assert_eq!(agent.analyze_calls(), 1);
        assert_eq!(*agent.updated_with.lock().unwrap(), vec![wanted.event.clone()]);

        let wf = scheduler.workflow(id).unwrap().unwrap();
        assert_eq!(wf.current_invocation, Some(wanted));
        assert_eq!(wf.status, ScheduleStatus::Completed);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_busy_workflow_queues_signals() {
        let gate = CancellationToken::new();
        let agent = Arc::new(
            interest_agent("reconfig")
                .with_update(|_| Ok(Continuation::wait_for_interest()))
                .gated(gate.clone()),
        );
        let scheduler = scheduler_with(agent.clone(), SchedulerStores::in_memory());
        let agent_id = AgentId::new("reconfig");

        let id = created(
            scheduler
                .start(&agent_id, TargetEntity::Cluster, signal(Scenario::PrimaryMove, "P", 1))
                .await
                .unwrap(),
        );
        wait_until(|| {
            scheduler
                .schedule_record(id)
                .is_some_and(|r| r.is_ready_to_accept_signal())
        })
        .await;

        let e1 = signal(Scenario::Reconfiguration, "P", 2);
        let e2 = signal(Scenario::Reconfiguration, "P", 3);
        assert_eq!(
            scheduler.start(&agent_id, TargetEntity::Cluster, e1.clone()).await.unwrap(),
            StartOutcome::Resumed(id)
        );
        assert_eq!(
            scheduler.start(&agent_id, TargetEntity::Cluster, e2.clone()).await.unwrap(),
            StartOutcome::Queued(id)
        );
        assert!(matches!(
            scheduler.start(&agent_id, TargetEntity::Cluster, e2.clone()).await,
            Err(FaultLensError::DuplicateSignal { .. })
        ));
        assert_eq!(scheduler.pending_signals(id), vec![e2.clone()]);
        assert_eq!(scheduler.inner.stores.pending.get(&id).unwrap().len(), 1);

        gate.cancel();
        wait_until(|| {
            agent.update_calls() == 1
                && scheduler
                    .schedule_record(id)
                    .is_some_and(|r| r.is_ready_to_accept_signal())
        })
        .await;

        assert_eq!(scheduler.run_activation_pass().await.unwrap(), 1);
        wait_until(|| agent.update_calls() == 2).await;
        assert_eq!(
            *agent.updated_with.lock().unwrap(),
            vec![e1.event.clone(), e2.event.clone()]
        );
        assert!(scheduler.pending_signals(id).is_empty());
        assert!(scheduler.inner.stores.pending.get(&id).unwrap().is_empty());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_step_notifies_and_removes_record() {
        let agent = Arc::new(TestAgent::new("broken", |_| {
            Err(FaultLensError::analysis("trace reader unavailable"))
        }));
        let scheduler = scheduler_with(agent.clone(), SchedulerStores::in_memory());
        let on_failed = Recorder::new();
        let on_either = Recorder::new();
        let on_finished = Recorder::new();
        let agent_id = AgentId::new("broken");
        scheduler.add_consumer(agent_id.clone(), on_failed.clone(), ConsumeOption::OnFailed);
        scheduler.add_consumer(agent_id.clone(), on_either.clone(), ConsumeOption::OnEither);
        scheduler.add_consumer(agent_id.clone(), on_finished.clone(), ConsumeOption::OnFinished);

        let id = created(
            scheduler
                .start(&agent_id, TargetEntity::Cluster, signal(Scenario::ProcessCrash, "N1", 1))
                .await
                .unwrap(),
        );
        wait_until(|| on_either.count() == 1 && scheduler.schedule_record(id).is_none()).await;
        wait_until(|| scheduler.pipeline_stats().total_failed == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(on_failed.count(), 1);
        assert_eq!(on_either.count(), 1);
        assert_eq!(on_finished.count(), 0);
        let result = on_failed.results.lock().unwrap()[0].clone();
        assert_eq!(result.outcome, WorkflowOutcome::Failed);
        assert_eq!(result.workflow.status, ScheduleStatus::Failed);

        assert!(scheduler.inner.stores.records.get(&id).unwrap().is_none());
        let wf = scheduler.workflow(id).unwrap().unwrap();
        assert_eq!(wf.status, ScheduleStatus::Failed);
        assert!(wf.exceptions[0].message.contains("trace reader unavailable"));

        // A step failure does not halt scheduling.
        assert!(!scheduler.pipeline_stats().faulted);
        assert_eq!(scheduler.notifications().len(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_agent_panic_is_captured() {
        let agent = Arc::new(TestAgent::new("panicky", |_| panic!("index out of range")));
        let scheduler = scheduler_with(agent, SchedulerStores::in_memory());
        let id = created(
            scheduler
                .start(&AgentId::new("panicky"), TargetEntity::Cluster, signal(Scenario::NodeUp, "N1", 1))
                .await
                .unwrap(),
        );
        wait_until(|| scheduler.schedule_record(id).is_none()).await;
        let wf = scheduler.workflow(id).unwrap().unwrap();
        assert_eq!(wf.status, ScheduleStatus::Failed);
        assert!(wf.exceptions[0].message.contains("index out of range"));
        assert!(!scheduler.pipeline_stats().faulted);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_for_scenario_registers_implicit_interest() {
        let agent = Arc::new(
            TestAgent::new("node", |wf| {
                Ok(if wf.progress == 1 {
                    Continuation::resume_on_scenario(Scenario::NodeUp)
                } else {
                    Continuation::done()
                })
            })
            .eligible_for(Scenario::NodeDown),
        );
        let scheduler = scheduler_with(agent.clone(), SchedulerStores::in_memory());
        let agent_id = AgentId::new("node");
        let node = TargetEntity::Node { name: "N1".into() };

        let down = TriggerSignal::new(
            SourceEvent::new("FM", Scenario::NodeDown, "N1", Utc::now()),
            node.clone(),
        );
        let id = created(scheduler.start(&agent_id, node.clone(), down).await.unwrap());
        wait_until(|| {
            scheduler
                .schedule_record(id)
                .is_some_and(|r| r.is_ready_to_accept_signal())
        })
        .await;
        let wf = scheduler.workflow(id).unwrap().unwrap();
        assert_eq!(wf.interest, Some(InterestPredicate::for_scenario(Scenario::NodeUp, "N1")));

        // Same event on another target is a contract violation.
        let up = TriggerSignal::new(
            SourceEvent::new("FM", Scenario::NodeUp, "N1", Utc::now()),
            node.clone(),
        );
        assert!(matches!(
            scheduler.start(&agent_id, TargetEntity::Cluster, up.clone()).await,
            Err(FaultLensError::TargetMismatch { .. })
        ));

        assert_eq!(
            scheduler.start(&agent_id, node, up).await.unwrap(),
            StartOutcome::Resumed(id)
        );
        wait_until(|| scheduler.schedule_record(id).is_none()).await;
        assert_eq!(agent.analyze_calls(), 2);
        assert_eq!(agent.update_calls(), 0);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_resumes_interrupted_workflow() {
        let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
        let stores = || SchedulerStores::new(backend.clone(), RetentionPolicy::KeepForever);

        // A previous process died mid-step an hour ago.
        let mut wf = AnalysisWorkflow::new(AgentId::new("steady"));
        wf.target = Some(TargetEntity::Cluster);
        let mut record = ScheduleRecord::new(wf.id, 2).unwrap();
        record.mark_queued().unwrap();
        record
            .mark_started(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        {
            let previous = stores();
            previous.records.persist(&wf.id, &record).unwrap();
            previous.workflows.persist(&wf.id, &wf).unwrap();
        }

        let agent = Arc::new(TestAgent::new("steady", |_| Ok(Continuation::done())));
        let scheduler = scheduler_with(agent.clone(), stores());
        assert_eq!(scheduler.recovery_report().resumed, 1);

        let recovered = scheduler.schedule_record(wf.id).unwrap();
        assert_eq!(recovered.status, ScheduleStatus::Suspended);
        assert_eq!(recovered.continuation(), Some(&Continuation::resume_immediately()));
        assert_eq!(recovered.scheduling.attempts, 1);

        assert_eq!(scheduler.run_activation_pass().await.unwrap(), 1);
        wait_until(|| scheduler.schedule_record(wf.id).is_none()).await;
        assert_eq!(agent.analyze_calls(), 1);
        assert_eq!(
            scheduler.workflow(wf.id).unwrap().unwrap().status,
            ScheduleStatus::Completed
        );
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_fails_workflow_out_of_attempts() {
        let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
        let stores = SchedulerStores::new(backend.clone(), RetentionPolicy::KeepForever);

        let wf = AnalysisWorkflow::new(AgentId::new("steady"));
        let mut record = ScheduleRecord::new(wf.id, 2).unwrap();
        record.mark_queued().unwrap();
        // Already recovered once before.
        record.increment_attempt();
        record.mark_started(Utc::now()).unwrap();
        stores.records.persist(&wf.id, &record).unwrap();
        stores.workflows.persist(&wf.id, &wf).unwrap();

        let agent = Arc::new(TestAgent::new("steady", |_| Ok(Continuation::done())));
        let scheduler = scheduler_with(
            agent.clone(),
            SchedulerStores::new(backend, RetentionPolicy::KeepForever),
        );
        assert_eq!(scheduler.recovery_report().exhausted, 1);
        assert!(scheduler.schedule_record(wf.id).is_none());
        assert!(stores.records.get(&wf.id).unwrap().is_none());

        let body = scheduler.workflow(wf.id).unwrap().unwrap();
        assert_eq!(body.status, ScheduleStatus::Failed);
        assert_eq!(body.exceptions.len(), 1);
        assert_eq!(scheduler.run_activation_pass().await.unwrap(), 0);
        assert_eq!(agent.analyze_calls(), 0);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_restores_pending_signals() {
        let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
        let stores = SchedulerStores::new(backend.clone(), RetentionPolicy::KeepForever);
        let id = Uuid::new_v4();
        let queued = signal(Scenario::Reconfiguration, "P", 1);
        stores
            .pending
            .set(&id, &VecDeque::from(vec![queued.clone()]))
            .unwrap();

        let agent = Arc::new(TestAgent::new("steady", |_| Ok(Continuation::done())));
        let scheduler = scheduler_with(
            agent,
            SchedulerStores::new(backend, RetentionPolicy::KeepForever),
        );
        assert_eq!(scheduler.recovery_report().pending_signals, 1);
        assert_eq!(scheduler.pending_signals(id), vec![queued]);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminal_record_is_persisted_before_cleanup() {
        let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
        let agent = Arc::new(TestAgent::new("steady", |_| Ok(Continuation::done())));
        let scheduler = scheduler_with(
            agent,
            SchedulerStores::new(backend.clone(), RetentionPolicy::KeepForever),
        );
        let watcher = Arc::new(StoredRecordAtNotify {
            records: PersistentStore::new(backend, SCHEDULE_RECORDS, RetentionPolicy::KeepForever),
            seen: Mutex::new(Vec::new()),
        });
        scheduler.add_consumer(AgentId::new("steady"), watcher.clone(), ConsumeOption::OnEither);

        let id = created(
            scheduler
                .start(&AgentId::new("steady"), TargetEntity::Cluster, signal(Scenario::NodeDown, "N1", 1))
                .await
                .unwrap(),
        );
        wait_until(|| scheduler.schedule_record(id).is_none()).await;
        assert_eq!(
            *watcher.seen.lock().unwrap(),
            vec![Some(ScheduleStatus::Completed)]
        );
        assert!(scheduler.inner.stores.records.get(&id).unwrap().is_none());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_settles_workflow_finished_before_cleanup() {
        let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
        let stores = SchedulerStores::new(backend.clone(), RetentionPolicy::KeepForever);

        // The previous process wrote the terminal record, then died before the body
        // and the cleanup.
        let mut wf = AnalysisWorkflow::new(AgentId::new("steady"));
        wf.status = ScheduleStatus::InProgress;
        let now = Utc::now();
        let mut record = ScheduleRecord::new(wf.id, 2).unwrap();
        record.mark_queued().unwrap();
        record.mark_started(now).unwrap();
        record.set_continuation(Continuation::done(), now).unwrap();
        stores.records.persist(&wf.id, &record).unwrap();
        stores.workflows.persist(&wf.id, &wf).unwrap();
        stores
            .pending
            .set(&wf.id, &VecDeque::from(vec![signal(Scenario::NodeUp, "N1", 2)]))
            .unwrap();

        let agent = Arc::new(TestAgent::new("steady", |_| Ok(Continuation::done())));
        let scheduler = scheduler_with(
            agent.clone(),
            SchedulerStores::new(backend, RetentionPolicy::KeepForever),
        );
        let report = scheduler.recovery_report();
        assert_eq!(report.restored, 0);
        assert_eq!(report.resumed, 0);
        assert!(scheduler.schedule_record(wf.id).is_none());
        assert!(stores.records.get(&wf.id).unwrap().is_none());
        assert!(stores.pending.get(&wf.id).unwrap().is_empty());
        assert_eq!(
            scheduler.workflow(wf.id).unwrap().unwrap().status,
            ScheduleStatus::Completed
        );

        assert_eq!(scheduler.run_activation_pass().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(agent.analyze_calls(), 0);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_retention_keeps_suspended_workflow_body() {
        let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
        let retention = RetentionPolicy::MaxAge(chrono::Duration::hours(1));
        let agent = Arc::new(interest_agent("reconfig"));
        let scheduler = scheduler_with(agent.clone(), SchedulerStores::new(backend.clone(), retention));
        let agent_id = AgentId::new("reconfig");

        let id = created(
            scheduler
                .start(&agent_id, TargetEntity::Cluster, signal(Scenario::PrimaryMove, "P", 1))
                .await
                .unwrap(),
        );
        wait_until(|| {
            scheduler
                .schedule_record(id)
                .is_some_and(|r| r.is_ready_to_accept_signal())
        })
        .await;

        // Age the live body past retention, next to the body of a long-ended workflow.
        let two_hours_ago = Utc::now() - chrono::Duration::hours(2);
        let body = backend.get(WORKFLOW_BODIES, &id.to_string()).unwrap().unwrap();
        backend
            .put(WORKFLOW_BODIES, &id.to_string(), &body.value, two_hours_ago)
            .unwrap();
        let mut ended = AnalysisWorkflow::new(agent_id.clone());
        ended.status = ScheduleStatus::Completed;
        backend
            .put(
                WORKFLOW_BODIES,
                &ended.id.to_string(),
                &serde_json::to_string(&ended).unwrap(),
                two_hours_ago,
            )
            .unwrap();

        assert_eq!(scheduler.prune_expired().unwrap(), 1);
        assert!(scheduler.workflow(ended.id).unwrap().is_none());
        assert!(scheduler.workflow(id).unwrap().is_some());
        assert!(scheduler.schedule_record(id).is_some());

        // The same pinning applies on restart.
        scheduler.shutdown().await;
        let restarted = scheduler_with(agent.clone(), SchedulerStores::new(backend, retention));
        assert_eq!(restarted.recovery_report().restored, 1);
        assert_eq!(restarted.recovery_report().pruned, 0);

        // The suspended workflow still takes its event.
        assert_eq!(
            restarted
                .start(&agent_id, TargetEntity::Cluster, signal(Scenario::Reconfiguration, "P", 2))
                .await
                .unwrap(),
            StartOutcome::Resumed(id)
        );
        wait_until(|| restarted.schedule_record(id).is_none()).await;
        assert_eq!(agent.update_calls(), 1);
        restarted.shutdown().await;
    }

    #[tokio::test]
    async fn test_schedule_periodic() {
        let agent = Arc::new(
            TestAgent::new("health", |_| Ok(Continuation::resume_after(Duration::from_millis(50))))
                .time_triggered(),
        );
        let scheduler = scheduler_with(agent.clone(), SchedulerStores::in_memory());
        scheduler.spawn_activation_loop().unwrap();

        let agent_id = AgentId::new("health");
        let id = scheduler
            .schedule_periodic(&agent_id, TargetEntity::Cluster)
            .await
            .unwrap();
        let again = scheduler
            .schedule_periodic(&agent_id, TargetEntity::Cluster)
            .await
            .unwrap();
        assert_eq!(id, again);

        wait_until(|| agent.analyze_calls() >= 3).await;
        let wf = scheduler.workflow(id).unwrap().unwrap();
        assert_eq!(
            wf.current_invocation.map(|s| s.event.scenario),
            Some(Scenario::Periodic)
        );
        // Timer resumes never consume attempts.
        assert_eq!(scheduler.schedule_record(id).unwrap().scheduling.attempts, 0);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_schedule_periodic_rejects_signal_agents() {
        let agent = Arc::new(TestAgent::new("events", |_| Ok(Continuation::done())));
        let scheduler = scheduler_with(agent, SchedulerStores::in_memory());
        assert!(matches!(
            scheduler
                .schedule_periodic(&AgentId::new("events"), TargetEntity::Cluster)
                .await,
            Err(FaultLensError::InvalidArgument(_))
        ));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_single_activation_loop() {
        let agent = Arc::new(TestAgent::new("a", |_| Ok(Continuation::done())));
        let scheduler = scheduler_with(agent, SchedulerStores::in_memory());
        assert!(scheduler.spawn_activation_loop().is_ok());
        assert!(scheduler.spawn_activation_loop().is_err());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_remove_all_state() {
        let agent = Arc::new(interest_agent("reconfig"));
        let scheduler = scheduler_with(agent.clone(), SchedulerStores::in_memory());
        let id = created(
            scheduler
                .start(&AgentId::new("reconfig"), TargetEntity::Cluster, signal(Scenario::PrimaryMove, "P", 1))
                .await
                .unwrap(),
        );
        wait_until(|| {
            scheduler
                .schedule_record(id)
                .is_some_and(|r| r.status == ScheduleStatus::Suspended)
        })
        .await;

        scheduler.stop(StopOptions::StopOnly).await.unwrap();
        assert!(scheduler.schedule_record(id).is_some());
        assert_eq!(agent.stops.load(Ordering::SeqCst), 1);

        scheduler.stop(StopOptions::RemoveAllState).await.unwrap();
        assert!(scheduler.schedule_records().is_empty());
        assert!(scheduler.workflow(id).unwrap().is_none());
        assert!(scheduler.inner.stores.records.snapshot().unwrap().is_empty());
        assert_eq!(agent.stops.load(Ordering::SeqCst), 2);

        assert_eq!(scheduler.reload_agent_configuration().await, 1);
        assert_eq!(agent.reloads.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_signals() {
        let agent = Arc::new(TestAgent::new("a", |_| Ok(Continuation::done())));
        let scheduler = scheduler_with(agent, SchedulerStores::in_memory());
        scheduler.shutdown().await;
        assert!(matches!(
            scheduler
                .start(&AgentId::new("a"), TargetEntity::Cluster, signal(Scenario::NodeDown, "N1", 1))
                .await,
            Err(FaultLensError::PipelineFaulted)
        ));
        assert!(scheduler.run_activation_pass().await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_bad_max_attempts() {
        let config = SchedulerConfig {
            max_attempts: 4,
            ..SchedulerConfig::default()
        };
        assert!(
            AnalysisScheduler::new(config, AgentRegistry::new(), SchedulerStores::in_memory()).is_err()
        );
    }
}
