use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;

use crate::rbac::FetchContext;
use crate::store::{Filter, ObjectStore, UpsertOptions};
use crate::types::{DeviceView, EdgeView, RunStatus, RunView, Runtime, ServiceView, WorkflowView};
use crate::workflow::graph::WorkflowGraph;

/// Captured outcome of one node execution against one target. A failed
/// node is normal data driving edge selection, not an error.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub success: bool,
    pub output: Value,
}

impl NodeOutcome {
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output,
        }
    }

    pub fn failure(output: Value) -> Self {
        Self {
            success: false,
            output,
        }
    }
}

/// Delegate actually talking to a target (a device session, an API
/// client). External collaborator; the engine only sees the outcome.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        service: &ServiceView,
        device: Option<&DeviceView>,
        payload: &Value,
    ) -> NodeOutcome;
}

/// Parameters of one dispatch.
#[derive(Debug, Clone, Default)]
pub struct RunParams {
    pub devices: Vec<u64>,
    pub pools: Vec<u64>,
    pub payload: Value,
}

/// One workflow being traversed. Nested workflows are frames pushed on an
/// explicit stack, never language recursion: depth stays bounded and
/// cancellation and aggregation points are visible.
struct Frame {
    runtime: Runtime,
    graph: WorkflowGraph,
    frontier: Vec<u64>,
    visited: HashSet<u64>,
    outcomes: HashMap<u64, bool>,
    layer: Option<Layer>,
    /// The node this frame represents in its parent, for nested runs.
    parent_node: Option<u64>,
    targets: Vec<u64>,
}

/// One traversal layer in flight: plain services already executed, nested
/// workflows dispatched one at a time.
struct Layer {
    pending_subflows: VecDeque<u64>,
    results: HashMap<u64, bool>,
}

/// Layered breadth-first traversal over workflow graphs: executes each
/// frontier node against the resolved target set, writes per-target
/// results through the object store, selects outgoing edges by outcome,
/// and aggregates per-node outcomes into the run status.
pub struct ExecutionEngine {
    store: Arc<ObjectStore>,
    runner: Arc<dyn NodeExecutor>,
}

impl ExecutionEngine {
    pub fn new(store: Arc<ObjectStore>, runner: Arc<dyn NodeExecutor>) -> Self {
        Self { store, runner }
    }

    /// Execute a service or workflow to completion on the calling task.
    pub async fn run(&self, service_id: u64, params: RunParams) -> Result<RunView> {
        let (_tx, rx) = watch::channel(false);
        self.run_with_cancel(Runtime::generate(), service_id, params, rx)
            .await
    }

    /// Execute with an externally controlled cancellation signal. The
    /// signal is checked between layers only; an in-flight layer always
    /// finishes.
    pub async fn run_with_cancel(
        &self,
        runtime: Runtime,
        service_id: u64,
        params: RunParams,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunView> {
        let service: ServiceView = self
            .store
            .fetch("service", &Filter::by_id(service_id), &FetchContext::system())?
            .view()?;
        let targets = self.expand_targets(&params.devices, &params.pools)?;
        self.create_run(&runtime, service_id, &targets, None)?;
        tracing::info!("run {runtime} started for {} '{}'", service.kind, service.name);

        let (status, fault) = if service.is_workflow() {
            self.run_workflow(&runtime, &service, targets, &params, cancel)
                .await
        } else {
            match self
                .execute_node(&runtime, &service, &targets, &params.payload)
                .await
            {
                Ok(true) => (RunStatus::Success, None),
                Ok(false) => (RunStatus::Failure, None),
                Err(err) => (RunStatus::Failure, Some(err.to_string())),
            }
        };

        self.seal_run(&runtime, status, fault)?;
        tracing::info!("run {runtime} finished: {status:?}");
        let run = self
            .store
            .fetch("run", &Filter::by_name(runtime.as_str()), &FetchContext::system())?
            .view()?;
        Ok(run)
    }

    async fn run_workflow(
        &self,
        runtime: &Runtime,
        service: &ServiceView,
        targets: Vec<u64>,
        params: &RunParams,
        mut cancel: watch::Receiver<bool>,
    ) -> (RunStatus, Option<String>) {
        let root = match self.make_frame(service.id, runtime.clone(), targets, None, None) {
            Ok(frame) => frame,
            Err(err) => return (RunStatus::Failure, Some(err.to_string())),
        };
        let mut stack = vec![root];
        match self.drive(&mut stack, params, &mut cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // Infrastructure fault: abort, sealing whatever nested runs
                // are still open.
                let fault = err.to_string();
                tracing::error!("run {runtime} aborted: {fault}");
                for frame in stack.drain(..) {
                    if frame.parent_node.is_some() {
                        let _ =
                            self.seal_run(&frame.runtime, RunStatus::Failure, Some(fault.clone()));
                    }
                }
                (RunStatus::Failure, Some(fault))
            }
        }
    }

    async fn drive(
        &self,
        stack: &mut Vec<Frame>,
        params: &RunParams,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(RunStatus, Option<String>)> {
        let mut child_result: Option<(u64, bool)> = None;
        loop {
            let Some(frame_idx) = stack.len().checked_sub(1) else {
                // The root frame reports through its finalization below.
                anyhow::bail!("traversal stack drained without a root result");
            };

            if let Some((node, ok)) = child_result.take() {
                if let Some(layer) = stack[frame_idx].layer.as_mut() {
                    layer.results.insert(node, ok);
                }
            }

            if stack[frame_idx].layer.is_none() {
                // Between layers: the only cancellation point.
                let cancelled = *cancel.borrow();
                if stack[frame_idx].frontier.is_empty() || cancelled {
                    let frame = stack.pop().expect("frame index is in bounds");
                    let status = classify(&frame.outcomes, &frame.graph, cancelled);
                    let fault = cancelled.then(|| "canceled".to_string());
                    match frame.parent_node {
                        Some(node) => {
                            self.seal_run(&frame.runtime, status, fault)?;
                            child_result = Some((node, status == RunStatus::Success));
                        }
                        // Root frame: the caller seals the run record.
                        None => return Ok((status, fault)),
                    }
                    continue;
                }

                let nodes: Vec<u64> = {
                    let frame = &mut stack[frame_idx];
                    let nodes: Vec<u64> = frame.frontier.drain(..).collect();
                    frame.visited.extend(nodes.iter().copied());
                    nodes
                };

                let mut plain = Vec::new();
                let mut subflows = VecDeque::new();
                for node in nodes {
                    let view: ServiceView = self
                        .store
                        .fetch("service", &Filter::by_id(node), &FetchContext::system())?
                        .view()?;
                    if view.is_workflow() {
                        subflows.push_back(node);
                    } else {
                        plain.push(view);
                    }
                }

                // Same-layer nodes are independent by construction; run
                // them concurrently.
                let frame_runtime = stack[frame_idx].runtime.clone();
                let frame_targets = stack[frame_idx].targets.clone();
                let outcomes = join_all(plain.iter().map(|service| {
                    self.execute_node(&frame_runtime, service, &frame_targets, &params.payload)
                }))
                .await;

                let mut results = HashMap::new();
                for (service, outcome) in plain.iter().zip(outcomes) {
                    results.insert(service.id, outcome?);
                }
                stack[frame_idx].layer = Some(Layer {
                    pending_subflows: subflows,
                    results,
                });
                continue;
            }

            let next_subflow = stack[frame_idx]
                .layer
                .as_mut()
                .expect("layer is open")
                .pending_subflows
                .pop_front();
            if let Some(sub_id) = next_subflow {
                let parent_runtime = stack[frame_idx].runtime.clone();
                let inherited = stack[frame_idx].targets.clone();
                match self.make_frame(
                    sub_id,
                    Runtime::generate(),
                    inherited,
                    Some(sub_id),
                    Some(&parent_runtime),
                ) {
                    Ok(frame) => stack.push(frame),
                    Err(err) if err.downcast_ref::<crate::workflow::graph::GraphFault>().is_some() => {
                        // The sub-run cannot start (malformed graph); the
                        // parent records a failed node and moves on.
                        tracing::error!("nested workflow {sub_id} failed to start: {err}");
                        stack[frame_idx]
                            .layer
                            .as_mut()
                            .expect("layer is open")
                            .results
                            .insert(sub_id, false);
                    }
                    // Store faults abort the whole run.
                    Err(err) => return Err(err),
                }
                continue;
            }

            // Layer complete: record outcomes and select edges.
            let layer = stack[frame_idx].layer.take().expect("layer is open");
            let frame = &mut stack[frame_idx];
            for (node, ok) in layer.results {
                frame.outcomes.insert(node, ok);
                for next in frame.graph.successors(node, ok) {
                    if !frame.visited.contains(&next) && !frame.frontier.contains(&next) {
                        frame.frontier.push(next);
                    }
                }
            }
        }
    }

    /// Load a workflow and its edges, validate the graph, and open its run
    /// record. Nested frames chain to the parent through `parent_runtime`
    /// and start from a fresh visited set.
    fn make_frame(
        &self,
        workflow_id: u64,
        runtime: Runtime,
        inherited_targets: Vec<u64>,
        parent_node: Option<u64>,
        parent_runtime: Option<&Runtime>,
    ) -> Result<Frame> {
        let workflow: WorkflowView = self
            .store
            .fetch("workflow", &Filter::by_id(workflow_id), &FetchContext::system())?
            .view()?;
        let service: ServiceView = self
            .store
            .fetch("service", &Filter::by_id(workflow_id), &FetchContext::system())?
            .view()?;
        let edges: Vec<EdgeView> = self
            .store
            .fetch_all(
                "workflow_edge",
                &Filter::all().with_field("workflow", json!(workflow_id)),
                &FetchContext::system(),
            )?
            .iter()
            .map(|record| record.view())
            .collect::<Result<_, _>>()?;

        let targets = if service.inherits_targets() {
            inherited_targets
        } else {
            self.expand_targets(&service.target_devices, &service.target_pools)?
        };

        if parent_runtime.is_some() {
            self.create_run(&runtime, workflow_id, &targets, parent_runtime)?;
        }
        let graph = WorkflowGraph::build(&workflow, &edges).map_err(|fault| {
            if parent_runtime.is_some() {
                let _ = self.seal_run(&runtime, RunStatus::Failure, Some(fault.to_string()));
            }
            anyhow::Error::new(fault)
        })?;

        Ok(Frame {
            runtime,
            frontier: vec![graph.start()],
            graph,
            visited: HashSet::new(),
            outcomes: HashMap::new(),
            layer: None,
            parent_node,
            targets,
        })
    }

    /// Execute one plain service node against its targets, writing one
    /// result record per target. Node success is the conjunction of the
    /// per-target outcomes.
    async fn execute_node(
        &self,
        runtime: &Runtime,
        service: &ServiceView,
        inherited: &[u64],
        payload: &Value,
    ) -> Result<bool> {
        let targets = if service.inherits_targets() {
            inherited.to_vec()
        } else {
            self.expand_targets(&service.target_devices, &service.target_pools)?
        };

        if targets.is_empty() {
            let outcome = self.runner.execute(service, None, payload).await;
            self.write_result(runtime, service.id, None, &outcome)?;
            return Ok(outcome.success);
        }

        let mut devices = Vec::with_capacity(targets.len());
        for id in &targets {
            let device: DeviceView = self
                .store
                .fetch("device", &Filter::by_id(*id), &FetchContext::system())?
                .view()?;
            devices.push(device);
        }

        let outcomes = join_all(
            devices
                .iter()
                .map(|device| self.runner.execute(service, Some(device), payload)),
        )
        .await;

        let mut success = true;
        for (device, outcome) in devices.iter().zip(outcomes) {
            success &= outcome.success;
            self.write_result(runtime, service.id, Some(device.id), &outcome)?;
        }
        Ok(success)
    }

    /// Explicit devices plus the member devices of explicit pools, in
    /// order, deduplicated.
    fn expand_targets(&self, devices: &[u64], pools: &[u64]) -> Result<Vec<u64>> {
        let mut targets = Vec::new();
        let mut seen = HashSet::new();
        for &device in devices {
            if seen.insert(device) {
                targets.push(device);
            }
        }
        for &pool_id in pools {
            let pool = self
                .store
                .fetch("pool", &Filter::by_id(pool_id), &FetchContext::system())?;
            for device in pool.id_list("devices") {
                if seen.insert(device) {
                    targets.push(device);
                }
            }
        }
        Ok(targets)
    }

    fn create_run(
        &self,
        runtime: &Runtime,
        service_id: u64,
        targets: &[u64],
        parent: Option<&Runtime>,
    ) -> Result<()> {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(runtime.as_str()));
        fields.insert("service".into(), json!(service_id));
        fields.insert("status".into(), json!(RunStatus::Running));
        fields.insert("targets".into(), json!(targets));
        if let Some(parent) = parent {
            fields.insert("parent_runtime".into(), json!(parent.as_str()));
        }
        self.store.upsert(
            "run",
            fields,
            &UpsertOptions::new().must_be_new(),
            &FetchContext::system(),
        )?;
        Ok(())
    }

    /// Terminal status write; after this the run accepts no node writes.
    fn seal_run(&self, runtime: &Runtime, status: RunStatus, fault: Option<String>) -> Result<()> {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(runtime.as_str()));
        fields.insert("status".into(), json!(status));
        if let Some(fault) = fault {
            fields.insert("fault".into(), json!(fault));
        }
        self.store.upsert(
            "run",
            fields,
            &UpsertOptions::new(),
            &FetchContext::system(),
        )?;
        Ok(())
    }

    fn write_result(
        &self,
        runtime: &Runtime,
        service_id: u64,
        device_id: Option<u64>,
        outcome: &NodeOutcome,
    ) -> Result<()> {
        let mut fields = Map::new();
        let name = match device_id {
            Some(device) => format!("{runtime}-{service_id}-{device}"),
            None => format!("{runtime}-{service_id}"),
        };
        fields.insert("name".into(), json!(name));
        fields.insert("runtime".into(), json!(runtime.as_str()));
        fields.insert("service".into(), json!(service_id));
        if let Some(device) = device_id {
            fields.insert("device".into(), json!(device));
        }
        fields.insert("success".into(), json!(outcome.success));
        fields.insert("output".into(), outcome.output.clone());
        self.store.upsert(
            "result",
            fields,
            &UpsertOptions::new().must_be_new(),
            &FetchContext::system(),
        )?;
        Ok(())
    }
}

/// Run status as a pure function of the recorded per-node outcomes and
/// the static graph:
/// - every executed node succeeded and the traversal ran to completion:
///   `Success`;
/// - otherwise, `Partial` when at least one terminal node (no outgoing
///   edges) executed and all executed terminals succeeded;
/// - otherwise `Failure` (a failing terminal, a traversal that never
///   reached one, or a cancelled/aborted run).
fn classify(outcomes: &HashMap<u64, bool>, graph: &WorkflowGraph, cancelled: bool) -> RunStatus {
    if outcomes.is_empty() {
        return RunStatus::Failure;
    }
    if !cancelled && outcomes.values().all(|&ok| ok) {
        return RunStatus::Success;
    }
    let mut reached_terminal = false;
    let mut terminals_ok = true;
    for (node, ok) in outcomes {
        if graph.is_terminal(*node) {
            reached_terminal = true;
            terminals_ok &= ok;
        }
    }
    if reached_terminal && terminals_ok {
        RunStatus::Partial
    } else {
        RunStatus::Failure
    }
}
