//! Run completion work on a pool of worker threads.

use crate::Error;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::error;

/// A unit of work triggered by a completion.
pub type Job = Box<dyn FnOnce() + Send>;

/// Interface to the workers that process completions.
///
/// Any worker may run any job, so jobs for the same connection may land on different
/// threads.
pub trait Executor: Send + Sync + 'static {
    /// Schedule `job` to run. Must not run it inline.
    fn execute(&self, job: Job);
}

impl Executor for ThreadPool {
    fn execute(&self, job: Job) {
        self.spawn(job);
    }
}

/// Creates a [rayon]-compatible thread pool with `workers` threads.
///
/// A worker blocked on buffer exhaustion is only unblocked by another worker releasing a
/// buffer, so at least two workers are required.
pub fn create_pool(workers: usize) -> Result<ThreadPool, Error> {
    if workers < 2 {
        return Err(Error::InvalidConfig("workers must be at least 2".into()));
    }
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|index| format!("overlap-worker-{index}"))
        .panic_handler(|_| error!("worker panicked"))
        .build()?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashSet,
        sync::{mpsc, Arc, Barrier},
        time::Duration,
    };

    #[test]
    fn test_create_pool() {
        let pool = create_pool(4).unwrap();
        assert_eq!(pool.current_num_threads(), 4);

        // All four jobs can only finish if they run on distinct threads
        let barrier = Arc::new(Barrier::new(4));
        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let barrier = barrier.clone();
            let tx = tx.clone();
            pool.execute(Box::new(move || {
                barrier.wait();
                tx.send(std::thread::current().id()).unwrap();
            }));
        }
        let threads = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(10)).unwrap())
            .collect::<HashSet<_>>();
        assert_eq!(threads.len(), 4);
    }

    #[test]
    fn test_single_worker_rejected() {
        assert!(matches!(create_pool(1), Err(Error::InvalidConfig(_))));
    }
}
