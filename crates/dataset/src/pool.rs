//! The execution-runtime seam
//!
//! The dataset layer consumes an abstract compute capability: run one job
//! per partition concurrently and hand the results back in partition
//! order. Job results cross the seam as bincode bytes so the trait stays
//! object-safe and a future remote pool can ship them over a wire
//! unchanged.
//!
//! `LocalPool` is the in-repo binding: each job runs on a coroutine and
//! handles are joined in partition order, so result ordering is
//! deterministic regardless of scheduling.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use strata_core::EngineError;

pub type Job = Box<dyn FnOnce() -> Result<Vec<u8>, EngineError> + Send + 'static>;

pub trait ComputePool: Send + Sync {
    /// Run the jobs concurrently; results are returned in job order.
    fn run(&self, jobs: Vec<Job>) -> Result<Vec<Vec<u8>>, EngineError>;

    /// Share an immutable blob with every worker.
    fn broadcast(&self, bytes: Vec<u8>) -> Arc<Vec<u8>>;
}

/// In-process pool running partition jobs on coroutines.
#[derive(Debug, Default, Clone)]
pub struct LocalPool;

impl LocalPool {
    pub fn new() -> Arc<LocalPool> {
        Arc::new(LocalPool)
    }
}

impl ComputePool for LocalPool {
    fn run(&self, jobs: Vec<Job>) -> Result<Vec<Vec<u8>>, EngineError> {
        // Safety: jobs own their captured state (no TLS, no borrowed
        // stack data), which is what coroutine::spawn requires.
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| unsafe { may::coroutine::spawn(move || job()) })
            .collect();
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let out = handle
                .join()
                .map_err(|_| EngineError::structural("partition job panicked"))??;
            results.push(out);
        }
        Ok(results)
    }

    fn broadcast(&self, bytes: Vec<u8>) -> Arc<Vec<u8>> {
        Arc::new(bytes)
    }
}

/// Run typed jobs through a pool, bincoding results across the seam.
pub fn run_typed<T, F>(
    pool: &dyn ComputePool,
    jobs: Vec<F>,
) -> Result<Vec<T>, EngineError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    let boxed: Vec<Job> = jobs
        .into_iter()
        .map(|job| {
            let wrapped: Job = Box::new(move || {
                let out = job()?;
                bincode::serialize(&out)
                    .map_err(|e| EngineError::Codec(format!("job result encode: {}", e)))
            });
            wrapped
        })
        .collect();
    pool.run(boxed)?
        .into_iter()
        .map(|bytes| {
            bincode::deserialize(&bytes)
                .map_err(|e| EngineError::Codec(format!("job result decode: {}", e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_in_job_order() {
        let pool = LocalPool::new();
        let jobs: Vec<_> = (0..32u64)
            .map(|i| move || Ok(i * 2))
            .collect();
        let got: Vec<u64> = run_typed(pool.as_ref(), jobs).unwrap();
        assert_eq!(got, (0..32u64).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_job_error_propagates() {
        let pool = LocalPool::new();
        let jobs: Vec<Box<dyn FnOnce() -> Result<u64, EngineError> + Send>> = vec![
            Box::new(|| Ok(1)),
            Box::new(|| Err(EngineError::user("boom"))),
        ];
        assert!(run_typed(pool.as_ref(), jobs).is_err());
    }
}
