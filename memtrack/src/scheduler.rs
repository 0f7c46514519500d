//! Worker pool executing dependency graphs of jobs.
//!
//! A [`JobGraph`] is built up front: every job names the jobs it depends
//! on, which must have been added before it. [`JobScheduler::submit`]
//! queues the jobs without dependencies; finishing a job releases the
//! dependents whose last dependency it was. A pool without workers runs
//! the whole graph inline on the submitting thread.

use std::{
    any::Any,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::debug;
use parking_lot::{Condvar, Mutex};

type JobFn = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobId(usize);

struct JobNode {
    name: &'static str,
    work: JobFn,
    deps: Vec<JobId>,
}

#[derive(Default)]
pub struct JobGraph {
    nodes: Vec<JobNode>,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job that runs once every job in `deps` has finished.
    pub fn add<F>(&mut self, name: &'static str, deps: &[JobId], work: F) -> JobId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = JobId(self.nodes.len());
        debug_assert!(deps.iter().all(|d| d.0 < id.0), "dependency on a later job");
        self.nodes.push(JobNode {
            name,
            work: Box::new(work),
            deps: deps.to_vec(),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

struct NodeState {
    name: &'static str,
    work: Mutex<Option<JobFn>>,
    pending: AtomicUsize,
    dependents: Vec<usize>,
}

struct GraphState {
    nodes: Vec<NodeState>,
    remaining: Mutex<usize>,
    done: Condvar,
    panic: Mutex<Option<(&'static str, Box<dyn Any + Send>)>>,
}

impl GraphState {
    fn new(graph: JobGraph) -> Self {
        let mut dependents = vec![Vec::new(); graph.nodes.len()];
        for (index, node) in graph.nodes.iter().enumerate() {
            for dep in &node.deps {
                dependents[dep.0].push(index);
            }
        }
        let nodes = graph
            .nodes
            .into_iter()
            .zip(dependents)
            .map(|(node, dependents)| NodeState {
                name: node.name,
                work: Mutex::new(Some(node.work)),
                pending: AtomicUsize::new(node.deps.len()),
                dependents,
            })
            .collect::<Vec<_>>();
        Self {
            remaining: Mutex::new(nodes.len()),
            nodes,
            done: Condvar::new(),
            panic: Mutex::new(None),
        }
    }

    fn roots(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.pending.load(Ordering::Relaxed) == 0)
            .map(|(i, _)| i)
    }
}

/// Completion handle of a submitted graph.
pub struct GraphHandle {
    state: Option<Arc<GraphState>>,
}

impl GraphHandle {
    pub fn is_done(&self) -> bool {
        self.state.as_ref().is_none_or(|s| *s.remaining.lock() == 0)
    }

    /// Blocks until every job of the graph has run. A panic raised by a
    /// job is resumed on the calling thread.
    pub fn wait(self) {
        let Some(state) = self.state else {
            return;
        };
        {
            let mut remaining = state.remaining.lock();
            while *remaining > 0 {
                state.done.wait(&mut remaining);
            }
        }
        if let Some((name, payload)) = state.panic.lock().take() {
            debug!("job {name} panicked");
            panic::resume_unwind(payload);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

struct WorkItem {
    graph: Arc<GraphState>,
    node: usize,
}

struct Worker {
    id: WorkerId,
    local: Mutex<VecDeque<WorkItem>>,
    has_work: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn new(id: WorkerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            local: Mutex::new(VecDeque::new()),
            has_work: Condvar::new(),
            handle: Mutex::new(None),
        })
    }

    fn push(&self, w: WorkItem) {
        {
            let mut q = self.local.lock();
            q.push_back(w);
        }
        self.has_work.notify_one();
    }

    fn pop(&self) -> Option<WorkItem> {
        self.local.lock().pop_front()
    }

    fn steal_back(&self) -> Option<WorkItem> {
        self.local.lock().pop_back()
    }
}

struct SchedulerShared {
    workers: Vec<Arc<Worker>>,
    next: AtomicUsize,
    should_stop: AtomicBool,
}

impl SchedulerShared {
    fn push(&self, item: WorkItem) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].push(item);
    }

    fn worker_loop(&self, me: &Worker) {
        loop {
            if self.should_stop.load(Ordering::Acquire) {
                break;
            }

            if let Some(work) = me.pop() {
                self.run_item(work);
                continue;
            }

            if let Some(work) = self.try_steal(me) {
                self.run_item(work);
                continue;
            }

            let timeout = Duration::from_millis(10);
            let mut guard = me.local.lock();
            if guard.is_empty() {
                let _ = me.has_work.wait_for(&mut guard, timeout);
            }
        }
    }

    fn try_steal(&self, me: &Worker) -> Option<WorkItem> {
        self.workers
            .iter()
            .filter(|w| w.id != me.id)
            .find_map(|w| w.steal_back())
    }

    fn run_item(&self, item: WorkItem) {
        let graph = &item.graph;
        let node = &graph.nodes[item.node];

        let work = node.work.lock().take();
        if let Some(work) = work {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
                graph.panic.lock().get_or_insert((node.name, payload));
            }
        }

        for &dependent in &node.dependents {
            if graph.nodes[dependent].pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.push(WorkItem {
                    graph: Arc::clone(graph),
                    node: dependent,
                });
            }
        }

        let mut remaining = graph.remaining.lock();
        *remaining -= 1;
        if *remaining == 0 {
            graph.done.notify_all();
        }
    }
}

/// Fixed pool of worker threads running [`JobGraph`]s.
pub struct JobScheduler {
    shared: Arc<SchedulerShared>,
}

impl JobScheduler {
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(SchedulerShared {
            workers: (0..workers).map(|i| Worker::new(WorkerId(i))).collect(),
            next: AtomicUsize::new(0),
            should_stop: AtomicBool::new(false),
        });

        for w in &shared.workers {
            let me = Arc::clone(&shared);
            let w_clone = Arc::clone(w);
            let handle = thread::Builder::new()
                .name(format!("memtrack-worker-{}", w.id.0))
                .spawn(move || me.worker_loop(&w_clone))
                .expect("spawn worker");
            *w.handle.lock() = Some(handle);
        }
        debug!("job scheduler started with {workers} workers");

        Self { shared }
    }

    pub fn workers(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn submit(&self, graph: JobGraph) -> GraphHandle {
        if graph.is_empty() {
            return GraphHandle { state: None };
        }

        if self.shared.workers.is_empty() {
            // Dependencies always point backwards, so insertion order is a
            // valid execution order.
            for node in graph.nodes {
                (node.work)();
            }
            return GraphHandle { state: None };
        }

        let state = Arc::new(GraphState::new(graph));
        let roots: Vec<_> = state.roots().collect();
        for node in roots {
            self.shared.push(WorkItem {
                graph: Arc::clone(&state),
                node,
            });
        }
        GraphHandle { state: Some(state) }
    }

    pub fn shutdown(&self) {
        self.shared.should_stop.store(true, Ordering::Release);
        for w in &self.shared.workers {
            w.has_work.notify_all();
            if let Some(h) = w.handle.lock().take() {
                let _ = h.join();
            }
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
