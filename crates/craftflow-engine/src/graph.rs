//! Compiled graphs and the engine that drives them.
//!
//! Cyclic control flow (the quality retry) is modeled as a route, not a loop
//! in node code: a check node's routing decision is a pure function of the
//! post-merge state, evaluated here, outside the node. Nodes stay idempotent
//! and testable in isolation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use craftflow_models::{CallbackEvent, QualityReport, WorkflowState, now_ms};
use craftflow_storage::{Storage, StoreError};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, NodeError};
use crate::node::{NodeContext, WorkflowNode};
use crate::runtime::run_node;
use crate::webhook::WebhookNotifier;

/// Marker step written by `claim_task`; not a graph node.
pub const STEP_CLAIMED: &str = "claimed";

/// Routing decision taken after a node completes.
pub enum Route {
    /// Unconditional edge.
    Next(String),
    /// Quality-gated edge. `passed=false` routes to `retry_to` while the
    /// class budget lasts, then falls through to `pass_to`
    /// (accept-and-proceed). `pass_to: None` ends the workflow.
    Quality {
        class: String,
        passed: bool,
        retry_to: String,
        pass_to: Option<String>,
    },
    End,
}

type RouterFn = Arc<dyn Fn(&WorkflowState) -> Route + Send + Sync>;

/// An immutable node set plus its edges.
pub struct CompiledGraph {
    entry: String,
    order: Vec<String>,
    nodes: HashMap<String, Arc<dyn WorkflowNode>>,
    routes: HashMap<String, RouterFn>,
}

impl CompiledGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&Arc<dyn WorkflowNode>> {
        self.nodes.get(name)
    }

    /// Node names in declaration order (drives progress reporting).
    pub fn step_names(&self) -> &[String] {
        &self.order
    }

    /// Evaluate the route out of `name`. Nodes without a declared route end
    /// the workflow.
    pub fn route_after(&self, name: &str, state: &WorkflowState) -> Route {
        match self.routes.get(name) {
            Some(router) => router(state),
            None => Route::End,
        }
    }
}

/// Builder for [`CompiledGraph`]. The first node added is the entry.
#[derive(Default)]
pub struct GraphBuilder {
    order: Vec<String>,
    nodes: HashMap<String, Arc<dyn WorkflowNode>>,
    routes: HashMap<String, RouterFn>,
}

impl GraphBuilder {
    pub fn node(mut self, node: Arc<dyn WorkflowNode>) -> Self {
        let name = node.name().to_string();
        if !self.nodes.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.nodes.insert(name, node);
        self
    }

    pub fn route<F>(mut self, from: &str, router: F) -> Self
    where
        F: Fn(&WorkflowState) -> Route + Send + Sync + 'static,
    {
        self.routes.insert(from.to_string(), Arc::new(router));
        self
    }

    /// Unconditional edge `from → to`.
    pub fn edge(self, from: &str, to: &str) -> Self {
        let target = to.to_string();
        self.route(from, move |_| Route::Next(target.clone()))
    }

    pub fn build(self) -> CompiledGraph {
        let entry = self.order.first().cloned().unwrap_or_default();
        CompiledGraph {
            entry,
            order: self.order,
            nodes: self.nodes,
            routes: self.routes,
        }
    }
}

/// Drives a [`WorkflowState`] through a graph, checkpointing after every
/// node and honoring retry budgets, cancellation and the task deadline.
pub struct GraphEngine {
    storage: Arc<Storage>,
    config: Arc<EngineConfig>,
    notifier: Option<Arc<WebhookNotifier>>,
}

impl GraphEngine {
    pub fn new(storage: Arc<Storage>, config: Arc<EngineConfig>) -> Self {
        Self {
            storage,
            config,
            notifier: None,
        }
    }

    /// Attach a notifier so tasks subscribed to `progress` get an event
    /// after every completed node.
    pub fn with_notifier(mut self, notifier: Arc<WebhookNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Run the graph to completion, mutating `state` in place.
    ///
    /// Entry point selection: a state without a `current_step` (or with the
    /// claim marker) starts at the graph entry; a checkpointed state resumes
    /// at the successor of its recorded step.
    pub async fn run(
        &self,
        graph: &CompiledGraph,
        state: &mut WorkflowState,
        ctx: &NodeContext,
        deadline: Instant,
    ) -> Result<(), EngineError> {
        let mut next = match state.base.current_step.clone() {
            None => graph.entry().to_string(),
            Some(step) if step == STEP_CLAIMED => graph.entry().to_string(),
            Some(step) => {
                if !graph.contains(&step) {
                    return Err(EngineError::IncompatibleCheckpoint(step));
                }
                info!(task_id = %state.base.task_id, step = %step, "Resuming from checkpoint");
                match self.resolve_route(graph, state, &step)? {
                    Some(successor) => successor,
                    None => {
                        self.finish(state);
                        return Ok(());
                    }
                }
            }
        };

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::TaskTimeout(self.elapsed_ms(state)));
            }

            let node = graph
                .node(&next)
                .ok_or_else(|| EngineError::IncompatibleCheckpoint(next.clone()))?;

            let run_result = run_node(node.as_ref(), state, ctx, deadline).await;
            let patch = match run_result {
                Ok(patch) => patch,
                Err(source) => return Err(self.node_failure(state, &next, source)),
            };

            state.apply_patch(patch);
            state.base.current_step = Some(next.clone());
            state.base.version += 1;
            self.persist_checkpoint(state, &next);
            self.emit_progress(state);

            match self.resolve_route(graph, state, &next)? {
                Some(successor) => next = successor,
                None => {
                    self.finish(state);
                    return Ok(());
                }
            }
        }
    }

    fn elapsed_ms(&self, state: &WorkflowState) -> u64 {
        now_ms().saturating_sub(state.base.start_time) as u64
    }

    fn finish(&self, state: &mut WorkflowState) {
        state.base.end_time = Some(now_ms());
        self.persist_checkpoint(state, "complete");
    }

    fn node_failure(&self, state: &mut WorkflowState, node: &str, source: NodeError) -> EngineError {
        state.base.error = Some(source.to_string());
        state.base.end_time = Some(now_ms());
        self.persist_checkpoint(state, node);
        match source {
            NodeError::Cancelled => EngineError::Cancelled,
            source => EngineError::Node {
                node: node.to_string(),
                source,
            },
        }
    }

    /// Evaluate the route out of `step`, applying the retry-budget policy
    /// for quality edges. Returns the successor, or `None` at the end.
    fn resolve_route(
        &self,
        graph: &CompiledGraph,
        state: &mut WorkflowState,
        step: &str,
    ) -> Result<Option<String>, EngineError> {
        match graph.route_after(step, state) {
            Route::End => Ok(None),
            Route::Next(successor) => {
                if !graph.contains(&successor) {
                    return Err(EngineError::IncompatibleCheckpoint(successor));
                }
                Ok(Some(successor))
            }
            Route::Quality {
                class,
                passed,
                retry_to,
                pass_to,
            } => {
                self.append_quality_report(state, &class);
                if passed {
                    return Ok(pass_to);
                }
                let budget = self.config.retry_budget(&class);
                let used = state.retry_count(&class);
                if used < budget {
                    state.bump_retry(&class);
                    self.mirror_retry_count(state, &class);
                    // Re-checkpoint so the bumped counter survives a crash
                    // before the regenerating node completes.
                    self.persist_checkpoint(state, step);
                    info!(
                        task_id = %state.base.task_id,
                        class = %class,
                        attempt = used + 1,
                        budget,
                        "Quality check failed, routing to rewrite"
                    );
                    Ok(Some(retry_to))
                } else {
                    info!(
                        task_id = %state.base.task_id,
                        class = %class,
                        budget,
                        "Retry budget exhausted, accepting artifact as-is"
                    );
                    Ok(pass_to)
                }
            }
        }
    }

    /// Detached progress webhook for subscribed tasks. Delivery runs in the
    /// background; the step loop never waits on it.
    fn emit_progress(&self, state: &WorkflowState) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let Ok(Some(task)) = self.storage.tasks.find_by_id(&state.base.task_id) else {
            return;
        };
        if !task.wants_callback(CallbackEvent::Progress) {
            return;
        }
        tokio::spawn(async move {
            notifier.notify_progress(&task).await;
        });
    }

    /// Append the latest report for `class` to the quality-check history.
    /// Convention: check nodes patch it under `{class}Quality`.
    fn append_quality_report(&self, state: &WorkflowState, class: &str) {
        let key = format!("{class}Quality");
        let Some(value) = state.data.get(&key) else {
            return;
        };
        match serde_json::from_value::<QualityReport>(value.clone()) {
            Ok(report) => {
                if let Err(e) = self.storage.quality.create(&state.base.task_id, &report) {
                    warn!(task_id = %state.base.task_id, error = %e, "Failed to append quality report");
                }
            }
            Err(e) => {
                warn!(task_id = %state.base.task_id, key = %key, error = %e, "Unreadable quality report in state");
            }
        }
    }

    /// Best-effort mirror of a state retry counter onto the task row.
    fn mirror_retry_count(&self, state: &WorkflowState, class: &str) {
        let task_id = &state.base.task_id;
        for _ in 0..2 {
            let task = match self.storage.tasks.find_by_id(task_id) {
                Ok(Some(task)) => task,
                Ok(None) => return,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Failed to read task for retry mirror");
                    return;
                }
            };
            match self
                .storage
                .tasks
                .increment_retry_count(task_id, class, task.version)
            {
                Ok(_) => return,
                Err(StoreError::VersionConflict(_)) => continue,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Failed to mirror retry count");
                    return;
                }
            }
        }
    }

    /// Checkpoint after a node. A failure here is logged, never fatal: a
    /// crash between node success and the next checkpoint re-executes an
    /// idempotent node.
    fn persist_checkpoint(&self, state: &WorkflowState, step: &str) {
        let task_id = &state.base.task_id;
        if let Ok(Some(task)) = self.storage.tasks.find_by_id(task_id)
            && let Err(e) = self
                .storage
                .tasks
                .update_current_step(task_id, step, task.version)
            && !matches!(e, StoreError::VersionConflict(_))
        {
            warn!(task_id = %task_id, step = %step, error = %e, "Failed to record current step");
        }
        match self.storage.checkpoints.save(task_id, step, state) {
            Ok(Some(version)) => {
                debug!(task_id = %task_id, step = %step, version, "Checkpointed")
            }
            Ok(None) => {
                warn!(task_id = %task_id, step = %step, "Checkpoint lost a version race, continuing")
            }
            Err(e) => {
                warn!(task_id = %task_id, step = %step, error = %e, "Checkpoint failed, continuing")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Services;
    use crate::services::mock::{MockImage, MockLlm, MockSearch};
    use async_trait::async_trait;
    use craftflow_models::{NewTask, StatePatch, Task, TaskMode, TaskStatus};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct RecordingNode {
        name: &'static str,
    }

    #[async_trait]
    impl WorkflowNode for RecordingNode {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(
            &self,
            state: &WorkflowState,
            _ctx: &NodeContext,
        ) -> Result<StatePatch, NodeError> {
            let mut patch = StatePatch::new();
            let mut log: Vec<String> = state
                .data
                .get("log")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            log.push(self.name.to_string());
            patch.insert("log".into(), serde_json::to_value(log).unwrap());
            Ok(patch)
        }
    }

    /// Produces an artifact and a quality verdict taken from a script.
    struct ScriptedCheckNode {
        verdicts: Vec<bool>,
    }

    #[async_trait]
    impl WorkflowNode for ScriptedCheckNode {
        fn name(&self) -> &str {
            "check"
        }

        async fn execute(
            &self,
            state: &WorkflowState,
            _ctx: &NodeContext,
        ) -> Result<StatePatch, NodeError> {
            let attempt = state
                .data
                .get("checkRuns")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            let passed = self.verdicts.get(attempt).copied().unwrap_or(true);
            let mut report = QualityReport::empty_pass("text", "v1");
            report.passed = passed;
            report.hard_constraints_passed = passed;
            report.score = if passed { 8.0 } else { 4.0 };

            let mut patch = StatePatch::new();
            patch.insert("checkRuns".into(), serde_json::json!(attempt as u64 + 1));
            patch.insert("textQuality".into(), serde_json::to_value(&report).unwrap());
            Ok(patch)
        }
    }

    fn graph_with_quality_loop(verdicts: Vec<bool>) -> CompiledGraph {
        CompiledGraph::builder()
            .node(Arc::new(RecordingNode { name: "write" }))
            .node(Arc::new(ScriptedCheckNode { verdicts }))
            .node(Arc::new(RecordingNode { name: "publish" }))
            .edge("write", "check")
            .route("check", |state| {
                let passed = state
                    .data
                    .get("textQuality")
                    .and_then(|v| v.get("passed"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                Route::Quality {
                    class: "text".to_string(),
                    passed,
                    retry_to: "write".to_string(),
                    pass_to: Some("publish".to_string()),
                }
            })
            .build()
    }

    fn setup(config: EngineConfig) -> (Arc<Storage>, GraphEngine, NodeContext, Task) {
        let storage = Arc::new(Storage::in_memory());
        let config = Arc::new(config);
        let engine = GraphEngine::new(storage.clone(), config.clone());
        let ctx = NodeContext::new(
            Services::new(
                Arc::new(MockLlm::new()),
                Arc::new(MockSearch::new()),
                Arc::new(MockImage::new()),
            ),
            CancellationToken::new(),
            config,
        );
        let task = storage
            .tasks
            .create(NewTask {
                workflow_type: "test".to_string(),
                mode: TaskMode::Sync,
                priority: 0,
                idempotency_key: None,
                callback_url: None,
                callback_events: vec![],
                typed_inputs: serde_json::json!({}),
            })
            .unwrap();
        (storage, engine, ctx, task)
    }

    fn run_log(state: &WorkflowState) -> Vec<String> {
        state
            .data
            .get("log")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn linear_graph_runs_to_completion_with_checkpoints() {
        let (storage, engine, ctx, task) = setup(EngineConfig::default());
        let graph = CompiledGraph::builder()
            .node(Arc::new(RecordingNode { name: "a" }))
            .node(Arc::new(RecordingNode { name: "b" }))
            .edge("a", "b")
            .build();

        let mut state = WorkflowState::for_task(&task);
        let deadline = Instant::now() + Duration::from_secs(30);
        engine.run(&graph, &mut state, &ctx, deadline).await.unwrap();

        assert_eq!(run_log(&state), vec!["a", "b"]);
        assert!(state.base.end_time.is_some());

        let stored = storage.tasks.find_by_id(&task.task_id).unwrap().unwrap();
        assert_eq!(stored.current_step.as_deref(), Some("complete"));
        assert!(stored.state_snapshot.is_some());
    }

    #[tokio::test]
    async fn quality_retry_loops_until_pass() {
        let (storage, engine, ctx, task) = setup(EngineConfig::default());
        // Fails twice, passes on the third check.
        let graph = graph_with_quality_loop(vec![false, false, true]);

        let mut state = WorkflowState::for_task(&task);
        let deadline = Instant::now() + Duration::from_secs(30);
        engine.run(&graph, &mut state, &ctx, deadline).await.unwrap();

        assert_eq!(run_log(&state), vec!["write", "write", "write", "publish"]);
        assert_eq!(state.retry_count("text"), 2);

        let stored = storage.tasks.find_by_id(&task.task_id).unwrap().unwrap();
        assert_eq!(stored.retry_counts.get("text"), Some(&2));
        // One quality row per check run.
        assert_eq!(storage.quality.find_by_task_id(&task.task_id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_takes_accept_edge() {
        let mut config = EngineConfig::default();
        config.retry_budgets.insert("text".to_string(), 3);
        let (_storage, engine, ctx, task) = setup(config);
        // A checker that never passes.
        let graph = graph_with_quality_loop(vec![false; 10]);

        let mut state = WorkflowState::for_task(&task);
        let deadline = Instant::now() + Duration::from_secs(30);
        engine.run(&graph, &mut state, &ctx, deadline).await.unwrap();

        // Writer runs budget + 1 times, then the accept edge delivers anyway.
        assert_eq!(
            run_log(&state),
            vec!["write", "write", "write", "write", "publish"]
        );
        assert_eq!(state.retry_count("text"), 3);
    }

    #[tokio::test]
    async fn resume_skips_completed_steps() {
        let (storage, engine, ctx, task) = setup(EngineConfig::default());
        let graph = CompiledGraph::builder()
            .node(Arc::new(RecordingNode { name: "a" }))
            .node(Arc::new(RecordingNode { name: "b" }))
            .node(Arc::new(RecordingNode { name: "c" }))
            .edge("a", "b")
            .edge("b", "c")
            .build();

        // Simulate a crashed run checkpointed after "a".
        let mut state = WorkflowState::for_task(&task);
        state
            .data
            .insert("log".into(), serde_json::json!(["a"]));
        state.base.current_step = Some("a".to_string());
        storage.checkpoints.save(&task.task_id, "a", &state).unwrap();

        let deadline = Instant::now() + Duration::from_secs(30);
        engine.run(&graph, &mut state, &ctx, deadline).await.unwrap();
        assert_eq!(run_log(&state), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn checkpoint_at_removed_node_is_incompatible() {
        let (_storage, engine, ctx, task) = setup(EngineConfig::default());
        let graph = CompiledGraph::builder()
            .node(Arc::new(RecordingNode { name: "a" }))
            .build();

        let mut state = WorkflowState::for_task(&task);
        state.base.current_step = Some("removed-step".to_string());

        let deadline = Instant::now() + Duration::from_secs(30);
        let err = engine
            .run(&graph, &mut state, &ctx, deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IncompatibleCheckpoint(_)));
    }

    #[tokio::test]
    async fn cancellation_observed_at_node_boundary() {
        let (_storage, engine, ctx, task) = setup(EngineConfig::default());
        let graph = CompiledGraph::builder()
            .node(Arc::new(RecordingNode { name: "a" }))
            .build();
        ctx.cancel.cancel();

        let mut state = WorkflowState::for_task(&task);
        let deadline = Instant::now() + Duration::from_secs(30);
        let err = engine
            .run(&graph, &mut state, &ctx, deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert!(run_log(&state).is_empty());
    }

    #[tokio::test]
    async fn expired_deadline_is_task_timeout() {
        let (_storage, engine, ctx, task) = setup(EngineConfig::default());
        let graph = CompiledGraph::builder()
            .node(Arc::new(RecordingNode { name: "a" }))
            .build();

        let mut state = WorkflowState::for_task(&task);
        let deadline = Instant::now() - Duration::from_millis(1);
        let err = engine
            .run(&graph, &mut state, &ctx, deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TaskTimeout(_)));
    }

    #[tokio::test]
    async fn node_failure_records_error_and_checkpoints() {
        struct FailingNode;

        #[async_trait]
        impl WorkflowNode for FailingNode {
            fn name(&self) -> &str {
                "failing"
            }
            fn retry_count(&self) -> u32 {
                0
            }
            async fn execute(
                &self,
                _state: &WorkflowState,
                _ctx: &NodeContext,
            ) -> Result<StatePatch, NodeError> {
                Err(NodeError::Permanent("upstream rejected".to_string()))
            }
        }

        let (storage, engine, ctx, task) = setup(EngineConfig::default());
        let graph = CompiledGraph::builder().node(Arc::new(FailingNode)).build();

        let mut state = WorkflowState::for_task(&task);
        let deadline = Instant::now() + Duration::from_secs(30);
        let err = engine
            .run(&graph, &mut state, &ctx, deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Node { .. }));
        assert!(state.base.error.is_some());
        assert!(state.base.end_time.is_some());

        // The task row itself is still not terminal; the executor owns that.
        let stored = storage.tasks.find_by_id(&task.task_id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
    }
}
