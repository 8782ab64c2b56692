use std::future::Future;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::error::ClusterResult;
use crate::state_machine::NodeId;

/// Outcome of a fan-out: per-target results plus the targets that failed
/// or missed their deadline. Partial results are the normal case, not an
/// error.
#[derive(Debug)]
pub struct ScatterOutcome<T> {
    pub ok: Vec<(NodeId, T)>,
    pub failed: Vec<NodeId>,
}

impl<T> ScatterOutcome<T> {
    pub fn success_count(&self) -> usize {
        self.ok.len()
    }

    pub fn succeeded_nodes(&self) -> Vec<NodeId> {
        self.ok.iter().map(|(n, _)| *n).collect()
    }
}

/// Fan a request out to `targets` with a per-call deadline and an overall
/// deadline. Every fan-out in the query plane and the replication manager
/// goes through here so deadline and partial-failure handling is uniform.
pub async fn scatter<T, F, Fut>(
    targets: Vec<NodeId>,
    per_call: Duration,
    overall: Duration,
    mut call: F,
) -> ScatterOutcome<T>
where
    T: Send + 'static,
    F: FnMut(NodeId) -> Fut,
    Fut: Future<Output = ClusterResult<T>> + Send + 'static,
{
    let deadline = Instant::now() + overall;
    let mut set: JoinSet<(NodeId, ClusterResult<T>)> = JoinSet::new();

    for target in &targets {
        let target = *target;
        let fut = call(target);
        set.spawn(async move {
            let result = match tokio::time::timeout(per_call, fut).await {
                Ok(result) => result,
                Err(_) => Err(crate::error::ClusterError::Timeout(per_call)),
            };
            (target, result)
        });
    }

    let mut ok = Vec::new();
    let mut failed = Vec::new();

    loop {
        let next = tokio::time::timeout_at(deadline, set.join_next()).await;
        match next {
            Ok(Some(Ok((target, Ok(value))))) => ok.push((target, value)),
            Ok(Some(Ok((target, Err(err))))) => {
                log::debug!("scatter target {} failed: {}", target, err);
                failed.push(target);
            }
            Ok(Some(Err(join_err))) => {
                log::warn!("scatter task panicked: {}", join_err);
            }
            Ok(None) => break,
            Err(_) => {
                // Overall deadline: whatever is still running counts as failed
                let done: std::collections::HashSet<NodeId> = ok
                    .iter()
                    .map(|(n, _)| *n)
                    .chain(failed.iter().copied())
                    .collect();
                for target in &targets {
                    if !done.contains(target) {
                        failed.push(*target);
                    }
                }
                set.abort_all();
                break;
            }
        }
    }

    ScatterOutcome { ok, failed }
}
