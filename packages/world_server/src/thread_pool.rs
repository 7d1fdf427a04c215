//! Thread pool for blocking work, such as storage IO, which the server thread must not wait on
//! unless it chooses to.

use crate::util_abort_handle::AbortHandle;
use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, Condvar};
use std::{
    thread,
    sync::{
        Arc,
        atomic::{
            AtomicU32,
            Ordering,
        },
    },
};


/// Thread pool of worker threads draining a shared job queue.
///
/// Clone-shareable. Worker threads shut down once all handles are dropped and the queue is
/// drained.
pub struct ThreadPool(Arc<State>);

// shared state
struct State {
    // jobs not yet taken by a worker
    queue: SegQueue<Job>,
    // number of jobs in queue. workers sleep on the condvar while it's 0.
    pending: Mutex<usize>,
    pending_cvar: Condvar,
    // counter of how may ThreadPool handles remain
    alive: AtomicU32,
}

// job sent to worker thread
struct Job {
    aborted: AbortHandle,
    work: Box<dyn FnOnce(AbortHandle) + Send + 'static>,
}

impl ThreadPool {
    /// Construct, spawning one thread per CPU.
    pub fn new() -> Self {
        Self::with_threads(num_cpus::get())
    }

    /// Construct, spawning the given number of threads (at least 1).
    pub fn with_threads(threads: usize) -> Self {
        let state = Arc::new(State {
            queue: SegQueue::new(),
            pending: Mutex::new(0),
            pending_cvar: Condvar::new(),
            alive: AtomicU32::new(1),
        });
        for i in 0..threads.max(1) {
            let state = Arc::clone(&state);
            let spawned = thread::Builder::new()
                .name(format!("storage-worker-{i}"))
                .spawn(move || thread_body(state));
            if let Err(e) = spawned {
                error!(%e, "failed to spawn thread pool worker");
            }
        }
        ThreadPool(state)
    }

    /// Submit a job to be done with the given abort handle.
    ///
    /// The abort handle is checked before executing and if aborted the job is discarded. If the
    /// work is done, it gets passed the provided abort handle.
    pub fn submit<F>(&self, aborted: AbortHandle, work: F)
    where
        F: FnOnce(AbortHandle) + Send + 'static,
    {
        self.0.queue.push(Job {
            aborted,
            work: Box::new(work),
        });
        *self.0.pending.lock() += 1;
        self.0.pending_cvar.notify_one();
    }
}

fn thread_body(state: Arc<State>) {
    loop {
        let mut pending = state.pending.lock();
        while *pending == 0 {
            if state.alive.load(Ordering::SeqCst) == 0 {
                return;
            }
            state.pending_cvar.wait(&mut pending);
        }
        *pending -= 1;
        drop(pending);

        // pushed before the count was incremented, so this is there
        if let Some(job) = state.queue.pop() {
            if !job.aborted.is_aborted() {
                (job.work)(job.aborted);
            }
        }
    }
}

impl Clone for ThreadPool {
    fn clone(&self) -> Self {
        self.0.alive.fetch_add(1, Ordering::SeqCst);
        ThreadPool(Arc::clone(&self.0))
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let alive = self.0.alive.fetch_sub(1, Ordering::SeqCst);
        if alive == 1 {
            let _pending = self.0.pending.lock();
            self.0.pending_cvar.notify_all();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_jobs_and_skips_aborted() {
        let pool = ThreadPool::with_threads(2);
        let (send, recv) = mpsc::channel();

        let aborted = AbortHandle::new();
        aborted.abort();
        let send2 = send.clone();
        pool.submit(aborted, move |_| send2.send("aborted").unwrap());

        for i in 0..4 {
            let send = send.clone();
            pool.submit(AbortHandle::new(), move |_| send.send(if i % 2 == 0 { "even" } else { "odd" }).unwrap());
        }
        drop(send);

        let mut got = recv.iter().collect::<Vec<_>>();
        got.sort();
        assert_eq!(got, vec!["even", "even", "odd", "odd"]);
    }
}
