//! Fixed-size worker pool with a bounded task queue, plus an ordering
//! collector for results.
//!
//! One mutex guards the queue; two condition variables signal "work
//! available" to workers and "slot available" to blocked submitters (the
//! latter doubles as the completion signal for [`ThreadPool::wait`]).
//! Submission blocks once the queue is at its limit, giving backpressure
//! instead of unbounded growth.

use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::debug;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// What to do with queued-but-unstarted tasks at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Run everything still queued before stopping.
    Drain,
    /// Stop as soon as running tasks finish; drop the rest of the queue.
    Abandon,
}

struct State {
    queue: VecDeque<Task>,
    active: usize,
    shutdown: Option<Shutdown>,
}

struct Shared {
    state: Mutex<State>,
    work_available: Condvar,
    slot_available: Condvar,
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    queue_limit: usize,
}

impl ThreadPool {
    /// `queue_limit` of zero means an unbounded queue.
    pub fn new(threads: usize, queue_limit: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                active: 0,
                shutdown: None,
            }),
            work_available: Condvar::new(),
            slot_available: Condvar::new(),
        });
        let workers = (0..threads.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("sylva-worker-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn worker")
            })
            .collect();
        Self {
            shared,
            workers,
            queue_limit,
        }
    }

    /// Enqueue a task, blocking while the queue is at its limit. Tasks
    /// submitted after shutdown began are dropped.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut st = self.shared.state.lock().expect("pool poisoned");
        while st.shutdown.is_none()
            && self.queue_limit != 0
            && st.queue.len() >= self.queue_limit
        {
            st = self.shared.slot_available.wait(st).expect("pool poisoned");
        }
        if st.shutdown.is_some() {
            return;
        }
        st.queue.push_back(Box::new(task));
        drop(st);
        self.shared.work_available.notify_one();
    }

    /// Block until the queue is empty and no task is running.
    pub fn wait(&self) {
        let mut st = self.shared.state.lock().expect("pool poisoned");
        while !st.queue.is_empty() || st.active > 0 {
            st = self.shared.slot_available.wait(st).expect("pool poisoned");
        }
    }

    /// Shut the pool down and join every worker.
    pub fn stop(mut self, mode: Shutdown) {
        self.begin_shutdown(mode);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!(?mode, "pool stopped");
    }

    fn begin_shutdown(&self, mode: Shutdown) {
        let mut st = self.shared.state.lock().expect("pool poisoned");
        if st.shutdown.is_none() {
            st.shutdown = Some(mode);
        }
        drop(st);
        self.shared.work_available.notify_all();
        self.shared.slot_available.notify_all();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.begin_shutdown(Shutdown::Drain);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut st = shared.state.lock().expect("pool poisoned");
            loop {
                match st.shutdown {
                    Some(Shutdown::Abandon) => return,
                    Some(Shutdown::Drain) if st.queue.is_empty() => return,
                    _ => {}
                }
                if let Some(task) = st.queue.pop_front() {
                    st.active += 1;
                    break task;
                }
                st = shared.work_available.wait(st).expect("pool poisoned");
            }
        };
        shared.slot_available.notify_all();
        task();
        let mut st = shared.state.lock().expect("pool poisoned");
        st.active -= 1;
        drop(st);
        shared.slot_available.notify_all();
    }
}

/// Reorders results back into submission order.
///
/// Workers finish in any order; a result whose predecessors have not all
/// been written yet is buffered, and each write flushes the longest
/// now-contiguous run.
pub struct OutputCollector<W: Write> {
    inner: Mutex<CollectorState<W>>,
}

struct CollectorState<W> {
    next: usize,
    pending: BTreeMap<usize, String>,
    sink: W,
}

impl<W: Write> OutputCollector<W> {
    pub fn new(sink: W) -> Self {
        Self {
            inner: Mutex::new(CollectorState {
                next: 0,
                pending: BTreeMap::new(),
                sink,
            }),
        }
    }

    /// Record the result of task `id`. Ids must be dense from zero.
    pub fn write(&self, id: usize, text: String) -> std::io::Result<()> {
        let mut guard = self.inner.lock().expect("collector poisoned");
        let st = &mut *guard;
        if id != st.next {
            st.pending.insert(id, text);
            return Ok(());
        }
        st.sink.write_all(text.as_bytes())?;
        st.next += 1;
        while let Some(buffered) = st.pending.remove(&st.next) {
            st.sink.write_all(buffered.as_bytes())?;
            st.next += 1;
        }
        st.sink.flush()
    }

    /// Consume the collector and return its sink.
    pub fn into_sink(self) -> W {
        self.inner
            .into_inner()
            .expect("collector poisoned")
            .sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    /// A `Write` handle shareable across threads.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn runs_every_task() {
        let pool = ThreadPool::new(4, 8);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        pool.stop(Shutdown::Drain);
    }

    #[test]
    fn drain_finishes_queued_tasks() {
        let pool = ThreadPool::new(1, 0);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.stop(Shutdown::Drain);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn abandon_drops_unstarted_tasks() {
        let pool = ThreadPool::new(1, 0);
        let counter = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                started_tx.send(()).unwrap();
                let _ = gate_rx.recv();
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        // The sole worker must be inside the gated task before anything else
        // is queued, or it could observe the abandon flag with all six tasks
        // still unstarted.
        started_rx.recv().unwrap();
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Release the gate only after shutdown is requested, so the worker
        // observes the abandon flag before touching the queue again.
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let _ = gate_tx.send(());
        });
        pool.stop(Shutdown::Abandon);
        releaser.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn output_is_emitted_in_submission_order() {
        let buf = SharedBuf::default();
        let collector = Arc::new(OutputCollector::new(buf.clone()));
        let pool = ThreadPool::new(4, 4);
        for i in 0..8usize {
            let collector = Arc::clone(&collector);
            pool.submit(move || {
                // Later submissions sleep less, finishing out of order.
                thread::sleep(Duration::from_millis(((8 - i) * 3) as u64));
                collector.write(i, format!("line {i}\n")).unwrap();
            });
        }
        pool.wait();
        pool.stop(Shutdown::Drain);
        let expected: String = (0..8).map(|i| format!("line {i}\n")).collect();
        assert_eq!(buf.contents(), expected);
    }

    #[test]
    fn collector_buffers_gaps() {
        let buf = SharedBuf::default();
        let collector = OutputCollector::new(buf.clone());
        collector.write(2, "c".into()).unwrap();
        collector.write(0, "a".into()).unwrap();
        assert_eq!(buf.contents(), "a");
        collector.write(1, "b".into()).unwrap();
        assert_eq!(buf.contents(), "abc");
    }
}
