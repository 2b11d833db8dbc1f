use crate::error::Result;
use crate::error::SearchError;
use std::future::Future;
use tokio::task::JoinSet;

/// Runs `run` over every job with at most `limit` tasks in flight.
///
/// The first failing job fails the whole call; returning drops the
/// `JoinSet`, which aborts every task still running. Output order follows
/// completion order, so callers sort what they need sorted.
pub async fn bounded_fan_out<J, T, F, Fut>(jobs: Vec<J>, limit: usize, run: F) -> Result<Vec<T>>
where
    F: Fn(J) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut pending = jobs.into_iter();
    let mut tasks = JoinSet::new();
    for job in pending.by_ref().take(limit.max(1)) {
        tasks.spawn(run(job));
    }

    let mut outputs = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let output = joined.map_err(|err| SearchError::Task(err.to_string()))??;
        outputs.push(output);
        if let Some(job) = pending.next() {
            tasks.spawn(run(job));
        }
    }
    Ok(outputs)
}
