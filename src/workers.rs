//! A fixed-size worker pool with per-thread scratch arenas.
//!
//! Jobs are indexed `0..total_jobs` and pulled from a shared atomic counter,
//! so the pool load-balances without any queue management. `run` blocks
//! until every job finished; that single barrier is the only synchronization
//! the backend relies on.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use bumpalo::Bump;
use crossbeam_channel::{Receiver, Sender};

/// Default capacity of each worker's bump arena.
pub const WORKER_SCRATCH_BYTES: usize = 64 * 1024 * 1024;

/// Per-thread state handed to every job.
pub struct WorkerScratch {
    /// Stable index of the executing thread, `0..num_threads`. Index 0 is
    /// also used by inline (caller-thread) execution.
    pub thread_idx: usize,
    /// Bump arena for job-lifetime temporaries. The job resets it on entry;
    /// the allocation itself never moves while a job runs.
    pub arena: Bump,
}

/// A `&dyn Fn` with its lifetime erased so it can cross the channel.
///
/// # Safety
/// `WorkerPool::run` blocks until every worker acknowledged completion, so
/// the referent strictly outlives all dereferences.
struct JobRef(*const (dyn Fn(u32, &mut WorkerScratch) + Sync));

unsafe impl Send for JobRef {}
unsafe impl Sync for JobRef {}

struct RunShared {
    next_job: AtomicU32,
    total_jobs: u32,
    job: JobRef,
    done: Sender<()>,
}

enum Message {
    Run(Arc<RunShared>),
    Shutdown,
}

/// The pool itself. Threads are started once and live until drop.
pub struct WorkerPool {
    senders: Vec<Sender<Message>>,
    done_rx: Receiver<()>,
    done_tx: Sender<()>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `num_threads` workers (0 selects the hardware thread count),
    /// each owning a scratch arena of `scratch_bytes`.
    pub fn new(num_threads: usize, scratch_bytes: usize) -> WorkerPool {
        let num_threads = if num_threads == 0 {
            thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1)
        } else {
            num_threads
        };

        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let mut senders = Vec::with_capacity(num_threads);
        let mut handles = Vec::with_capacity(num_threads);

        for thread_idx in 0..num_threads {
            let (tx, rx) = crossbeam_channel::unbounded::<Message>();
            senders.push(tx);

            let handle = thread::Builder::new()
                .name(format!("dataloom-worker-{}", thread_idx))
                .spawn(move || worker_main(thread_idx, scratch_bytes, rx))
                .unwrap_or_else(|err| panic!("failed to spawn worker thread: {}", err));
            handles.push(handle);
        }

        WorkerPool {
            senders,
            done_rx,
            done_tx,
            handles,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.senders.len()
    }

    /// Execute `total_jobs` invocations of `job` across the pool and wait
    /// for all of them. The closure may be called from any worker thread,
    /// with any job index; indices are handed out exactly once.
    pub fn run<F>(&self, total_jobs: u32, job: &F)
    where
        F: Fn(u32, &mut WorkerScratch) + Sync,
    {
        if total_jobs == 0 {
            return;
        }

        let erased: &(dyn Fn(u32, &mut WorkerScratch) + Sync) = job;
        // Erase the borrow lifetime; see the safety note on JobRef.
        let erased: &'static (dyn Fn(u32, &mut WorkerScratch) + Sync) =
            unsafe { core::mem::transmute(erased) };
        let shared = Arc::new(RunShared {
            next_job: AtomicU32::new(0),
            total_jobs,
            job: JobRef(erased as *const _),
            done: self.done_tx.clone(),
        });

        let mut live = 0;
        for sender in &self.senders {
            if sender.send(Message::Run(Arc::clone(&shared))).is_ok() {
                live += 1;
            }
        }

        for _ in 0..live {
            if self.done_rx.recv().is_err() {
                log::error!("worker pool lost its completion channel mid-run");
                break;
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for sender in &self.senders {
            let _ = sender.send(Message::Shutdown);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_main(thread_idx: usize, scratch_bytes: usize, rx: Receiver<Message>) {
    let mut scratch = WorkerScratch {
        thread_idx,
        arena: Bump::with_capacity(scratch_bytes),
    };

    while let Ok(message) = rx.recv() {
        match message {
            Message::Run(shared) => {
                loop {
                    let job_idx = shared.next_job.fetch_add(1, Ordering::Relaxed);
                    if job_idx >= shared.total_jobs {
                        break;
                    }
                    // Safety: the dispatcher blocks in `run` until we ack.
                    let job = unsafe { &*shared.job.0 };
                    job(job_idx, &mut scratch);
                }
                let _ = shared.done.send(());
            }
            Message::Shutdown => break,
        }
    }
}
