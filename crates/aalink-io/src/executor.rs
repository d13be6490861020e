//! Shared work queue, serialized strands and the executor handle that
//! promises bind to.
//!
//! The queue itself is thread-agnostic: the embedding application
//! spawns one to four threads that call [`WorkQueue::run`], or a test
//! drains it deterministically with [`WorkQueue::poll`]. A [`Strand`]
//! guarantees that no two of its tasks run concurrently, regardless of
//! how many worker threads drive the queue.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

type Task = Box<dyn FnOnce() + Send>;

/// Shared FIFO work queue.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    ready: Condvar,
}

struct QueueState {
    tasks: VecDeque<Task>,
    stopped: bool,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    tasks: VecDeque::new(),
                    stopped: false,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Enqueue a task. Tasks posted after [`stop`](Self::stop) are
    /// silently dropped; nothing may run once the queue is stopped.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return;
        }
        state.tasks.push_back(Box::new(task));
        drop(state);
        self.inner.ready.notify_one();
    }

    /// Worker loop: execute tasks until the queue is stopped. Blocks
    /// while the queue is empty. Call from one or more dedicated
    /// threads.
    pub fn run(&self) {
        loop {
            let task = {
                let mut state = self.inner.state.lock();
                loop {
                    if state.stopped {
                        return;
                    }
                    if let Some(task) = state.tasks.pop_front() {
                        break task;
                    }
                    self.inner.ready.wait(&mut state);
                }
            };
            task();
        }
    }

    /// Execute every ready task on the calling thread without blocking,
    /// including tasks posted by the tasks themselves. Returns the
    /// number executed. This is the deterministic driver used by the
    /// test suites.
    pub fn poll(&self) -> usize {
        let mut count = 0;
        loop {
            let task = self.inner.state.lock().tasks.pop_front();
            match task {
                Some(task) => {
                    task();
                    count += 1;
                }
                None => return count,
            }
        }
    }

    /// Stop the queue. Workers return, queued tasks are discarded and
    /// later posts are ignored. Idempotent.
    pub fn stop(&self) {
        let discarded = {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            let discarded = state.tasks.len();
            state.tasks.clear();
            discarded
        };
        if discarded > 0 {
            debug!(discarded, "work queue stopped with tasks pending");
        }
        self.inner.ready.notify_all();
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

static NEXT_STRAND_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Ids of the strands currently executing on this thread, innermost
    /// last. Lets `dispatch` run inline instead of re-posting.
    static ACTIVE_STRANDS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Serialized facet of a [`WorkQueue`]: at most one task of a strand
/// runs at any moment, in posting order.
///
/// Cloning yields another handle to the same strand.
#[derive(Clone)]
pub struct Strand {
    queue: WorkQueue,
    inner: Arc<StrandInner>,
}

struct StrandInner {
    id: usize,
    state: Mutex<StrandState>,
}

struct StrandState {
    pending: VecDeque<Task>,
    active: bool,
}

impl Strand {
    pub fn new(queue: &WorkQueue) -> Self {
        Self {
            queue: queue.clone(),
            inner: Arc::new(StrandInner {
                id: NEXT_STRAND_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(StrandState {
                    pending: VecDeque::new(),
                    active: false,
                }),
            }),
        }
    }

    /// Enqueue a task behind every task already pending on this strand.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        let schedule = {
            let mut state = self.inner.state.lock();
            state.pending.push_back(Box::new(task));
            if state.active {
                false
            } else {
                state.active = true;
                true
            }
        };
        if schedule {
            Self::schedule(&self.queue, &self.inner);
        }
    }

    /// Run the task inline when the caller is already executing on this
    /// strand, otherwise post it. Inline execution preserves the strand
    /// guarantee because the caller *is* the strand's single running
    /// task.
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_current() {
            task();
        } else {
            self.post(task);
        }
    }

    /// Whether the calling thread is currently executing a task of this
    /// strand.
    pub fn is_current(&self) -> bool {
        let id = self.inner.id;
        ACTIVE_STRANDS.with(|stack| stack.borrow().contains(&id))
    }

    fn schedule(queue: &WorkQueue, inner: &Arc<StrandInner>) {
        let queue_handle = queue.clone();
        let inner_handle = Arc::clone(inner);
        queue.post(move || Self::run_next(queue_handle, inner_handle));
    }

    /// Execute one pending task, then yield the queue to other strands
    /// by re-posting if more tasks are waiting.
    fn run_next(queue: WorkQueue, inner: Arc<StrandInner>) {
        let task = inner.state.lock().pending.pop_front();
        if let Some(task) = task {
            let id = inner.id;
            ACTIVE_STRANDS.with(|stack| stack.borrow_mut().push(id));
            task();
            ACTIVE_STRANDS.with(|stack| {
                stack.borrow_mut().pop();
            });
        }
        let reschedule = {
            let mut state = inner.state.lock();
            if state.pending.is_empty() {
                state.active = false;
                false
            } else {
                true
            }
        };
        if reschedule {
            Self::schedule(&queue, &inner);
        }
    }
}

/// Executor handle a promise binds to: the shared queue or one strand.
#[derive(Clone)]
pub enum Executor {
    Queue(WorkQueue),
    Strand(Strand),
}

impl Executor {
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        match self {
            Executor::Queue(queue) => queue.post(task),
            Executor::Strand(strand) => strand.post(task),
        }
    }
}

impl From<&WorkQueue> for Executor {
    fn from(queue: &WorkQueue) -> Self {
        Executor::Queue(queue.clone())
    }
}

impl From<&Strand> for Executor {
    fn from(strand: &Strand) -> Self {
        Executor::Strand(strand.clone())
    }
}
