//! Task scheduling seam for per-block parallel work.
//!
//! The engine never owns a thread pool.  [`ArchiveReader::parallel_decompress`]
//! hands one boxed task per block to whatever [`Scheduler`] the caller
//! supplies and joins through a countdown channel, so the choice of executor
//! stays with the application.
//!
//! | Scheduler            | Runs tasks                                       |
//! |----------------------|--------------------------------------------------|
//! | [`InlineScheduler`]  | immediately, on the submitting thread            |
//! | [`ThreadScheduler`]  | one `std::thread` per task                        |
//! | [`RayonScheduler`]   | on rayon's global pool (`parallel` feature)      |
//! | `rayon::ThreadPool`  | on that pool (`parallel` feature)                |
//!
//! With [`InlineScheduler`] every block has been decoded by the time
//! `parallel_decompress` returns; the join still works the same way.
//!
//! [`ArchiveReader::parallel_decompress`]: crate::io_stream::reader::ArchiveReader::parallel_decompress

use std::sync::{Arc, Mutex};
use std::thread;

/// Unit of work handed to a scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync {
    fn submit(&self, task: Task);
}

/// Runs each task to completion before `submit` returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn submit(&self, task: Task) {
        task()
    }
}

/// Spawns a detached OS thread per task.
#[derive(Debug, Clone, Default)]
pub struct ThreadScheduler {
    name: Option<String>,
}

impl ThreadScheduler {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()) }
    }
}

impl Scheduler for ThreadScheduler {
    fn submit(&self, task: Task) {
        let mut builder = thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        // Spawning only fails when the OS refuses a thread; run in place then.
        let task = Arc::new(Mutex::new(Some(task)));
        let handle = Arc::clone(&task);
        let spawned = builder.spawn(move || {
            if let Some(t) = handle.lock().ok().and_then(|mut g| g.take()) {
                t()
            }
        });
        if spawned.is_err() {
            if let Some(t) = task.lock().ok().and_then(|mut g| g.take()) {
                t()
            }
        }
    }
}

// ── Rayon ────────────────────────────────────────────────────────────────────

/// Submits to rayon's global pool.
#[cfg(feature = "parallel")]
#[derive(Debug, Clone, Copy, Default)]
pub struct RayonScheduler;

#[cfg(feature = "parallel")]
impl Scheduler for RayonScheduler {
    fn submit(&self, task: Task) {
        rayon::spawn(task)
    }
}

#[cfg(feature = "parallel")]
impl Scheduler for rayon::ThreadPool {
    fn submit(&self, task: Task) {
        self.spawn(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn inline_runs_before_returning() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        InlineScheduler.submit(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn thread_scheduler_runs_every_task() {
        let (tx, rx) = mpsc::channel();
        let sched = ThreadScheduler::named("solid7z-test");
        for i in 0..4 {
            let tx = tx.clone();
            sched.submit(Box::new(move || tx.send(i).unwrap()));
        }
        drop(tx);
        let mut got: Vec<i32> = rx.iter().collect();
        got.sort();
        assert_eq!(got, [0, 1, 2, 3]);
    }
}
