//! Parallel chunk executor
//!
//! Runs one blocking cipher task per chunk on a bounded pool, enforces a
//! per-task timeout and hands results to a sink strictly in index order.
//! Any task failure cancels the rest of the operation.

mod progress;

pub use progress::{NoProgress, ProgressEvent, ProgressObserver, Scaled};

#[cfg(test)]
pub(crate) use progress::tests::Recorder;

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Bounded pool of blocking cipher workers
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    task_timeout: Duration,
}

impl WorkerPool {
    pub fn new(workers: usize, task_timeout: Duration) -> Self {
        WorkerPool {
            workers: workers.max(1),
            task_timeout,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `op` over every chunk and feed `(index, output)` to `sink` in
    /// ascending index order.
    ///
    /// `total` is the number of chunks `chunks` will yield. Progress is
    /// reported as `flushed * 100 / total` after each chunk the sink accepts,
    /// except the terminal 100: the caller emits that once its output is
    /// committed. Chunks are read on the blocking pool.
    pub async fn execute<I, F, S>(
        &self,
        chunks: I,
        total: u32,
        op: F,
        mut sink: S,
        progress: &dyn ProgressObserver,
    ) -> Result<()>
    where
        I: Iterator<Item = Result<Chunk>> + Send + 'static,
        F: Fn(Chunk) -> Result<Vec<u8>> + Send + Sync + 'static,
        S: FnMut(u32, Vec<u8>) -> Result<()>,
    {
        let op = Arc::new(op);
        let cancel = Arc::new(AtomicBool::new(false));
        let permits = Arc::new(Semaphore::new(self.workers));
        let window = self.workers * 2;
        let timeout = self.task_timeout;

        let mut tasks: JoinSet<(u32, Result<Vec<u8>>)> = JoinSet::new();
        let mut ready: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut source = Some(chunks);
        let mut next_out: u32 = 0;
        let mut exhausted = false;

        let outcome: Result<()> = async {
            loop {
                // Keep a bounded read-ahead window of in-flight plus unflushed chunks
                while !exhausted && tasks.len() + ready.len() < window {
                    let next = match source.take() {
                        Some(reader) => {
                            let (next, reader) = read_next(reader).await?;
                            source = Some(reader);
                            next
                        }
                        None => None,
                    };

                    match next {
                        Some(Ok(chunk)) => {
                            let index = chunk.index;
                            let op = Arc::clone(&op);
                            let cancel = Arc::clone(&cancel);
                            let permits = Arc::clone(&permits);

                            tasks.spawn(async move {
                                let result =
                                    run_task(index, chunk, op, cancel, permits, timeout).await;
                                (index, result)
                            });
                        }
                        Some(Err(e)) => return Err(e),
                        None => exhausted = true,
                    }
                }

                let (index, result) = match tasks.join_next().await {
                    None => break,
                    Some(Ok(pair)) => pair,
                    Some(Err(e)) => return Err(Error::Internal(format!("chunk task panicked: {}", e))),
                };
                ready.insert(index, result?);

                while let Some(data) = ready.remove(&next_out) {
                    sink(next_out, data)?;
                    next_out += 1;
                    debug!("Chunk {} flushed ({}/{})", next_out - 1, next_out, total);
                    if next_out < total {
                        progress.percent((next_out as u64 * 100 / total as u64) as u8);
                    }
                }
            }

            if next_out != total {
                return Err(Error::Internal(format!(
                    "executor produced {} of {} chunks",
                    next_out, total
                )));
            }
            Ok(())
        }
        .await;

        if let Err(e) = &outcome {
            warn!("Aborting chunk execution: {}", e);
            cancel.store(true, Ordering::SeqCst);
            tasks.abort_all();
        }

        outcome
    }
}

/// Pull the next chunk on the blocking pool, handing the reader back
async fn read_next<I>(mut reader: I) -> Result<(Option<Result<Chunk>>, I)>
where
    I: Iterator<Item = Result<Chunk>> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let next = reader.next();
        (next, reader)
    })
    .await
    .map_err(|e| Error::Internal(format!("chunk reader panicked: {}", e)))
}

async fn run_task<F>(
    index: u32,
    chunk: Chunk,
    op: Arc<F>,
    cancel: Arc<AtomicBool>,
    permits: Arc<Semaphore>,
    timeout: Duration,
) -> Result<Vec<u8>>
where
    F: Fn(Chunk) -> Result<Vec<u8>> + Send + Sync + 'static,
{
    let _permit = permits
        .acquire_owned()
        .await
        .map_err(|_| Error::Cancelled)?;

    if cancel.load(Ordering::SeqCst) {
        return Err(Error::Cancelled);
    }

    let handle = tokio::task::spawn_blocking(move || {
        if cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        op(chunk)
    });

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(out))) => Ok(out),
        Ok(Ok(Err(e))) => Err(Error::ChunkFailed {
            index,
            source: Box::new(e),
        }),
        Ok(Err(join)) => Err(Error::ChunkFailed {
            index,
            source: Box::new(Error::Internal(join.to_string())),
        }),
        Err(_) => Err(Error::TaskTimeout {
            index,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
