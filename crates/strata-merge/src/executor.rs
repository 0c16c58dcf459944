//! Task graph executor.
//!
//! Runs a [`TaskGraph`] on the tokio blocking pool. Tasks are split into two
//! resource classes, each with its own width: compute tasks (merge
//! arithmetic) and storage tasks (loading, saving, bookkeeping). Among ready
//! tasks the one added to the plan first runs first.
//!
//! A produced value stays resident only while a consumer still needs it.
//! Earlier consumers get copies and the last one takes the value itself, or a
//! copy if its edge is `Clone`. Either way the value is dropped once its last
//! consumer has been dispatched.
//!
//! Storage tasks feeding compute tasks run ahead of compute by at most one
//! value per compute worker plus one, so loads overlap merging without
//! piling up.

use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::graph::{BufferPolicy, ResourceClass, TaskContext, TaskGraph, TaskId, TaskInputs, TaskValue};
use crate::{Device, MergeError, MergeOptions, Result};

/// A completed plan target.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    /// Producing task.
    pub task: TaskId,
    /// Its value.
    pub value: TaskValue,
}

/// Executor sizing and placement.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Where compute tasks run.
    pub compute_device: Device,
    /// Where values wait between tasks.
    pub storage_device: Device,
    /// Concurrent compute tasks on the CPU. Defaults to the available parallelism.
    pub cpu_workers: Option<usize>,
    /// Concurrent storage tasks.
    pub io_workers: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            compute_device: Device::Cpu,
            storage_device: Device::Cpu,
            cpu_workers: None,
            io_workers: 2,
        }
    }
}

impl From<&MergeOptions> for ExecutorOptions {
    fn from(options: &MergeOptions) -> Self {
        Self {
            compute_device: options.compute_device,
            storage_device: options.storage_device,
            cpu_workers: options.cpu_workers,
            io_workers: options.io_workers,
        }
    }
}

impl ExecutorOptions {
    /// Maximum concurrent tasks of `class`.
    pub fn width(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::Compute => match self.compute_device {
                Device::Accelerator => 1,
                Device::Cpu => self
                    .cpu_workers
                    .unwrap_or_else(|| {
                        std::thread::available_parallelism().map_or(1, |n| n.get())
                    })
                    .max(1),
            },
            ResourceClass::Storage => self.io_workers.max(1),
        }
    }

    /// How many storage outputs bound for compute tasks may be loading or
    /// waiting at once.
    pub fn prefetch_window(&self) -> usize {
        self.width(ResourceClass::Compute) + 1
    }
}

/// Per-task bookkeeping, indexed by plan position.
struct Slot {
    waiting_on: usize,
    consumers_left: usize,
    feeds_compute: bool,
    dependents: Vec<usize>,
    inputs: Vec<(usize, BufferPolicy)>,
    class: ResourceClass,
}

/// Runs a task graph.
pub struct Executor {
    graph: TaskGraph,
    ctx: TaskContext,
    options: ExecutorOptions,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("graph", &self.graph)
            .field("options", &self.options)
            .finish()
    }
}

impl Executor {
    /// Executor over `graph`. The context's devices are taken from `options`.
    pub fn new(graph: TaskGraph, mut ctx: TaskContext, options: ExecutorOptions) -> Self {
        ctx.compute_device = options.compute_device;
        ctx.storage_device = options.storage_device;
        Self {
            graph,
            ctx,
            options,
        }
    }

    fn slots(&self) -> Vec<Slot> {
        let position: HashMap<_, _> = self
            .graph
            .order
            .iter()
            .enumerate()
            .map(|(pos, &idx)| (idx, pos))
            .collect();

        self.graph
            .order
            .iter()
            .map(|&idx| {
                let inputs: Vec<(usize, BufferPolicy)> = self
                    .graph
                    .graph
                    .edges_directed(idx, Direction::Incoming)
                    .map(|e| (position[&e.source()], *e.weight()))
                    .collect();
                let outgoing: Vec<_> = self
                    .graph
                    .graph
                    .edges_directed(idx, Direction::Outgoing)
                    .map(|e| (position[&e.target()], *e.weight()))
                    .collect();
                let class = self.graph.graph[idx].resource();
                let feeds_compute = class == ResourceClass::Storage
                    && outgoing.iter().any(|(t, _)| {
                        self.graph.graph[self.graph.order[*t]].resource() == ResourceClass::Compute
                    });
                Slot {
                    waiting_on: inputs.len(),
                    consumers_left: outgoing.len(),
                    feeds_compute,
                    dependents: outgoing.iter().map(|(t, _)| *t).collect(),
                    inputs,
                    class,
                }
            })
            .collect()
    }

    /// Run every task, sending completed targets on `events`.
    ///
    /// Returns the first task error unchanged. Tasks still running when an
    /// error arrives are abandoned and their results discarded.
    pub async fn run(self, events: mpsc::UnboundedSender<TaskOutput>) -> Result<()> {
        let mut slots = self.slots();
        let total = slots.len();
        let tasks: Vec<_> = self
            .graph
            .order
            .iter()
            .map(|&idx| Arc::clone(&self.graph.graph[idx]))
            .collect();

        let mut ready: BTreeSet<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.waiting_on == 0)
            .map(|(pos, _)| pos)
            .collect();
        let mut values: HashMap<usize, TaskValue> = HashMap::new();
        let mut running: HashMap<ResourceClass, usize> = HashMap::new();
        let mut in_flight: JoinSet<(usize, Result<TaskValue>)> = JoinSet::new();
        let mut completed = 0;
        // Storage outputs for compute that are loading or not yet fully consumed.
        let mut prefetched = 0;
        let mut loading = 0;
        let window = self.options.prefetch_window();

        info!(
            "Executing {} tasks (compute width {}, storage width {})",
            total,
            self.options.width(ResourceClass::Compute),
            self.options.width(ResourceClass::Storage)
        );

        loop {
            // A full window of loaded values that no compute task can consume
            // yet would never drain, so the window is lifted.
            let blocked = loading == 0
                && running.get(&ResourceClass::Compute).copied().unwrap_or(0) == 0
                && !ready
                    .iter()
                    .any(|&pos| slots[pos].class == ResourceClass::Compute);

            let mut budget = running.clone();
            let mut staged = prefetched;
            let mut dispatchable = Vec::new();
            for &pos in &ready {
                let class = slots[pos].class;
                let used = budget.entry(class).or_insert(0);
                if *used >= self.options.width(class) {
                    continue;
                }
                if slots[pos].feeds_compute {
                    if staged >= window && !blocked {
                        continue;
                    }
                    staged += 1;
                }
                *used += 1;
                dispatchable.push(pos);
            }

            for pos in dispatchable {
                ready.remove(&pos);
                if slots[pos].feeds_compute {
                    prefetched += 1;
                    loading += 1;
                }
                let mut inputs = HashMap::with_capacity(slots[pos].inputs.len());
                for (producer, policy) in slots[pos].inputs.clone() {
                    let value = take_input(&mut slots[producer], &mut values, producer, policy)?;
                    if slots[producer].consumers_left == 0 && slots[producer].feeds_compute {
                        prefetched -= 1;
                    }
                    inputs.insert(tasks[producer].id().clone(), value);
                }

                let task = Arc::clone(&tasks[pos]);
                let ctx = self.ctx.clone();
                let class = slots[pos].class;
                *running.entry(class).or_default() += 1;
                debug!("Dispatching {}", task.id());

                in_flight.spawn_blocking(move || {
                    let mut inputs = TaskInputs::new(task.id().clone(), inputs);
                    if class == ResourceClass::Compute {
                        inputs = inputs.to_device(ctx.compute_device);
                    }
                    let result = task
                        .execute(inputs, &ctx)
                        .map(|value| value.to_device(ctx.storage_device));
                    (pos, result)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                if completed < total {
                    return Err(MergeError::Executor(format!(
                        "stalled after {} of {} tasks",
                        completed, total
                    )));
                }
                break;
            };

            let (pos, result) = joined.map_err(|e| MergeError::Executor(e.to_string()))?;
            let value = result?;
            completed += 1;
            if let Some(n) = running.get_mut(&slots[pos].class) {
                *n = n.saturating_sub(1);
            }
            if slots[pos].feeds_compute {
                loading -= 1;
            }

            let id = tasks[pos].id();
            debug!("Completed {} ({}/{})", id, completed, total);
            // A closed receiver only means nobody is listening.
            let report = |value: TaskValue| {
                let _ = events.send(TaskOutput {
                    task: id.clone(),
                    value,
                });
            };
            let target = self.graph.is_target(id);
            if slots[pos].dependents.is_empty() {
                if target {
                    report(value);
                }
            } else {
                if target {
                    report(value.clone());
                }
                values.insert(pos, value);
            }

            for dependent in slots[pos].dependents.clone() {
                let slot = &mut slots[dependent];
                slot.waiting_on -= 1;
                if slot.waiting_on == 0 {
                    ready.insert(dependent);
                }
            }
        }

        Ok(())
    }

    /// Run every task and return the completed targets in completion order.
    pub async fn run_collect(self) -> Result<Vec<TaskOutput>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.run(tx).await?;
        let mut outputs = Vec::new();
        while let Some(output) = rx.recv().await {
            outputs.push(output);
        }
        Ok(outputs)
    }
}

fn take_input(
    slot: &mut Slot,
    values: &mut HashMap<usize, TaskValue>,
    producer: usize,
    policy: BufferPolicy,
) -> Result<TaskValue> {
    let missing = || MergeError::Executor(format!("value of task #{} is no longer resident", producer));
    slot.consumers_left = slot.consumers_left.saturating_sub(1);
    if slot.consumers_left > 0 {
        return values.get(&producer).cloned().ok_or_else(missing);
    }
    let value = values.remove(&producer).ok_or_else(missing)?;
    Ok(match policy {
        BufferPolicy::Move => value,
        BufferPolicy::Clone => value.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::SumTask;
    use crate::graph::{Dependency, Task, TaskGraphBuilder};
    use crate::loader::{LoaderCache, LoaderOptions};
    use crate::writer::ShardWriter;
    use crate::Tensor;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;
    use std::time::Duration;

    fn ctx() -> TaskContext {
        TaskContext::cpu(Arc::new(LoaderCache::new(LoaderOptions::default())))
    }

    fn options(workers: usize) -> ExecutorOptions {
        ExecutorOptions {
            cpu_workers: Some(workers),
            io_workers: workers,
            ..Default::default()
        }
    }

    fn scalar(output: &TaskOutput) -> f32 {
        match &output.value {
            TaskValue::Tensor(t) => t.to_f32_vec().unwrap()[0],
            other => panic!("unexpected value {}", other.kind()),
        }
    }

    #[derive(Debug)]
    struct Recorder {
        id: TaskId,
        deps: Vec<Dependency>,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &str, deps: &[&str], log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Task> {
            Arc::new(Self {
                id: TaskId::new("rec", name),
                deps: deps
                    .iter()
                    .map(|d| Dependency::moved(TaskId::new("rec", d)))
                    .collect(),
                log: Arc::clone(log),
                fail: false,
            })
        }

        fn failing(name: &str) -> Arc<dyn Task> {
            Arc::new(Self {
                id: TaskId::new("rec", name),
                deps: Vec::new(),
                log: Arc::default(),
                fail: true,
            })
        }
    }

    impl Task for Recorder {
        fn id(&self) -> &TaskId {
            &self.id
        }

        fn dependencies(&self) -> Vec<Dependency> {
            self.deps.clone()
        }

        fn execute(&self, _inputs: TaskInputs, _ctx: &TaskContext) -> Result<TaskValue> {
            if self.fail {
                return Err(MergeError::TensorNotFound("boom".to_string()));
            }
            self.log.lock().push(self.id.to_string());
            Ok(TaskValue::Done)
        }
    }

    #[tokio::test]
    async fn test_diamond_sums() {
        let mut builder = TaskGraphBuilder::new();
        builder.add(SumTask::leaf("a", 1.0));
        builder.add(SumTask::over("b", &["a"]));
        builder.add(SumTask::over("c", &["a"]));
        builder.add_target(SumTask::over("d", &["b", "c"]));
        let graph = builder.build().unwrap();

        let outputs = Executor::new(graph, ctx(), options(4))
            .run_collect()
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].task, TaskId::new("sum", "d"));
        assert_eq!(scalar(&outputs[0]), 2.0);
    }

    #[tokio::test]
    async fn test_only_targets_reported() {
        let mut builder = TaskGraphBuilder::new();
        builder.add_target(SumTask::leaf("a", 3.0));
        builder.add_target(SumTask::over("b", &["a"]));
        let graph = builder.build().unwrap();

        let mut outputs = Executor::new(graph, ctx(), options(2))
            .run_collect()
            .await
            .unwrap();
        outputs.sort_by(|x, y| x.task.cmp(&y.task));
        assert_eq!(outputs.len(), 2);
        assert_eq!(scalar(&outputs[0]), 3.0);
        assert_eq!(scalar(&outputs[1]), 3.0);
    }

    #[tokio::test]
    async fn test_ready_tasks_run_in_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = TaskGraphBuilder::new();
        builder.add(Recorder::new("z", &[], &log));
        builder.add(Recorder::new("m", &[], &log));
        builder.add(Recorder::new("a", &[], &log));
        builder.add(Recorder::new("after", &["z", "m", "a"], &log));
        let graph = builder.build().unwrap();

        Executor::new(graph, ctx(), options(1))
            .run_collect()
            .await
            .unwrap();
        assert_eq!(
            *log.lock(),
            vec!["rec:z", "rec:m", "rec:a", "rec:after"]
        );
    }

    #[tokio::test]
    async fn test_first_error_is_returned_unchanged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = TaskGraphBuilder::new();
        builder.add(Recorder::failing("bad"));
        builder.add_target(Recorder::new("never", &["bad"], &log));
        let graph = builder.build().unwrap();

        let err = Executor::new(graph, ctx(), options(1))
            .run_collect()
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::TensorNotFound(ref n) if n == "boom"));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_accelerator_compute_width_is_one() {
        let opts = ExecutorOptions {
            compute_device: Device::Accelerator,
            cpu_workers: Some(8),
            io_workers: 3,
            ..Default::default()
        };
        assert_eq!(opts.width(ResourceClass::Compute), 1);
        assert_eq!(opts.width(ResourceClass::Storage), 3);
    }

    #[test]
    fn test_last_consumer_takes_value() {
        let mut slot = Slot {
            waiting_on: 0,
            consumers_left: 2,
            feeds_compute: false,
            dependents: vec![1, 2],
            inputs: Vec::new(),
            class: ResourceClass::Storage,
        };
        let mut values = HashMap::from([(
            0,
            TaskValue::Tensor(Tensor::from_f32(&[1.0], vec![1], safetensors::Dtype::F32).unwrap()),
        )]);
        take_input(&mut slot, &mut values, 0, BufferPolicy::Move).unwrap();
        assert!(values.contains_key(&0));
        take_input(&mut slot, &mut values, 0, BufferPolicy::Move).unwrap();
        assert!(!values.contains_key(&0));
    }

    #[test]
    fn test_clone_consumer_does_not_keep_value_alive() {
        let mut slot = Slot {
            waiting_on: 0,
            consumers_left: 2,
            feeds_compute: false,
            dependents: vec![1, 2],
            inputs: Vec::new(),
            class: ResourceClass::Storage,
        };
        let mut values = HashMap::from([(0, TaskValue::Done)]);
        take_input(&mut slot, &mut values, 0, BufferPolicy::Clone).unwrap();
        assert!(values.contains_key(&0));
        let last = take_input(&mut slot, &mut values, 0, BufferPolicy::Clone).unwrap();
        assert_eq!(last.kind(), "signal");
        assert!(values.is_empty());
    }

    type Body = Box<dyn Fn(TaskInputs) -> Result<TaskValue> + Send + Sync>;

    /// Task running an arbitrary closure.
    struct FnTask {
        id: TaskId,
        deps: Vec<Dependency>,
        resource: ResourceClass,
        body: Body,
    }

    impl std::fmt::Debug for FnTask {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("FnTask").field("id", &self.id).finish()
        }
    }

    impl FnTask {
        fn new(
            name: &str,
            deps: Vec<Dependency>,
            resource: ResourceClass,
            body: impl Fn(TaskInputs) -> Result<TaskValue> + Send + Sync + 'static,
        ) -> Arc<dyn Task> {
            Arc::new(Self {
                id: fn_id(name),
                deps,
                resource,
                body: Box::new(body),
            })
        }
    }

    impl Task for FnTask {
        fn id(&self) -> &TaskId {
            &self.id
        }

        fn dependencies(&self) -> Vec<Dependency> {
            self.deps.clone()
        }

        fn resource(&self) -> ResourceClass {
            self.resource
        }

        fn execute(&self, inputs: TaskInputs, _ctx: &TaskContext) -> Result<TaskValue> {
            (self.body)(inputs)
        }
    }

    fn fn_id(name: &str) -> TaskId {
        TaskId::new("fn", name)
    }

    #[tokio::test]
    async fn test_clone_edges_release_producer_value() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().to_path_buf();
        let handle: Arc<Mutex<Weak<ShardWriter>>> = Arc::new(Mutex::new(Weak::new()));
        let resident_after = Arc::new(Mutex::new(None));

        let mut builder = TaskGraphBuilder::new();
        let slot = Arc::clone(&handle);
        builder.add(FnTask::new("writer", vec![], ResourceClass::Storage, move |_| {
            let writer = Arc::new(ShardWriter::new(&out, 1024)?);
            *slot.lock() = Arc::downgrade(&writer);
            Ok(TaskValue::Writer(writer))
        }));
        for name in ["first", "second"] {
            builder.add(FnTask::new(
                name,
                vec![Dependency::cloned(fn_id("writer"))],
                ResourceClass::Storage,
                |mut inputs| {
                    inputs.take_writer(&fn_id("writer"))?;
                    Ok(TaskValue::Done)
                },
            ));
        }
        let seen = Arc::clone(&handle);
        let flag = Arc::clone(&resident_after);
        builder.add_target(FnTask::new(
            "check",
            vec![
                Dependency::moved(fn_id("first")),
                Dependency::moved(fn_id("second")),
            ],
            ResourceClass::Storage,
            move |_| {
                *flag.lock() = Some(seen.lock().upgrade().is_some());
                Ok(TaskValue::Done)
            },
        ));
        let graph = builder.build().unwrap();

        Executor::new(graph, ctx(), options(2))
            .run_collect()
            .await
            .unwrap();
        assert_eq!(*resident_after.lock(), Some(false));
    }

    #[tokio::test]
    async fn test_loads_stay_within_window_of_slow_compute() {
        let loaded = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut builder = TaskGraphBuilder::new();
        for i in 0..20 {
            let (count, high) = (Arc::clone(&loaded), Arc::clone(&peak));
            builder.add(FnTask::new(
                &format!("load{}", i),
                vec![],
                ResourceClass::Storage,
                move |_| {
                    let now = count.fetch_add(1, Ordering::SeqCst) + 1;
                    high.fetch_max(now, Ordering::SeqCst);
                    Ok(TaskValue::Done)
                },
            ));
            let count = Arc::clone(&loaded);
            builder.add(FnTask::new(
                &format!("merge{}", i),
                vec![Dependency::moved(fn_id(&format!("load{}", i)))],
                ResourceClass::Compute,
                move |_| {
                    count.fetch_sub(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(10));
                    Ok(TaskValue::Done)
                },
            ));
        }
        let graph = builder.build().unwrap();

        let opts = ExecutorOptions {
            compute_device: Device::Accelerator,
            io_workers: 2,
            ..Default::default()
        };
        let window = opts.prefetch_window();
        assert_eq!(window, 2);
        Executor::new(graph, ctx(), opts).run_collect().await.unwrap();

        // The window plus the load whose merge was dispatched but has not started.
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= window + 1, "{} loads waited on compute", peak);
    }

    #[tokio::test]
    async fn test_window_lifted_when_compute_needs_more_loads() {
        let mut builder = TaskGraphBuilder::new();
        let names: Vec<String> = (0..4).map(|i| format!("load{}", i)).collect();
        for name in &names {
            builder.add(FnTask::new(name, vec![], ResourceClass::Storage, |_| {
                Ok(TaskValue::Done)
            }));
        }
        builder.add_target(FnTask::new(
            "merge",
            names.iter().map(|n| Dependency::moved(fn_id(n))).collect(),
            ResourceClass::Compute,
            |inputs| {
                assert_eq!(inputs.len(), 4);
                Ok(TaskValue::Done)
            },
        ));
        let graph = builder.build().unwrap();

        let opts = ExecutorOptions {
            compute_device: Device::Accelerator,
            io_workers: 1,
            ..Default::default()
        };
        let outputs = Executor::new(graph, ctx(), opts).run_collect().await.unwrap();
        assert_eq!(outputs.len(), 1);
    }
}
