//! Depth-first DAG iteration with a visited set
//!
//! Visits every reachable node exactly once, in pre-order, and stops
//! cleanly when the visitor breaks. Cancellation is checked at every node
//! boundary. Used by the upload path and by chunks-count calculation (the
//! latter over a purely-local store).

use std::collections::HashSet;
use std::ops::ControlFlow;

use cid::Cid;
use tokio_util::sync::CancellationToken;

use filament_core::{Block, FileError, FileResult};
use filament_store::BlockGetter;

use crate::dag::{DagNode, DagService};

/// Visitor outcome: continue walking or end the walk cleanly.
pub type WalkControl = ControlFlow<()>;

/// Walks the DAG from `root`, invoking `visit` once per distinct node.
pub async fn walk_dag<F>(
    dag: &DagService,
    root: &Cid,
    cancel: &CancellationToken,
    mut visit: F,
) -> FileResult<()>
where
    F: FnMut(&Block, &DagNode) -> WalkControl,
{
    let mut visited: HashSet<Cid> = HashSet::new();
    let mut stack = vec![*root];

    while let Some(cid) = stack.pop() {
        if cancel.is_cancelled() {
            return Err(FileError::Other(anyhow::anyhow!("walk cancelled")));
        }
        if !visited.insert(cid) {
            continue;
        }
        let block = dag.store().get(&cid).await?;
        let node = DagNode::decode(&block.data)?;
        if let ControlFlow::Break(()) = visit(&block, &node) {
            return Ok(());
        }
        // Reverse so children pop in link order: depth-first, pre-order.
        for link in node.links.iter().rev() {
            if !visited.contains(&link.cid) {
                stack.push(link.cid);
            }
        }
    }
    Ok(())
}

/// Number of distinct nodes reachable from `root`.
pub async fn chunks_count(dag: &DagService, root: &Cid) -> FileResult<u64> {
    let mut count = 0u64;
    walk_dag(dag, root, &CancellationToken::new(), |_, _| {
        count += 1;
        ControlFlow::Continue(())
    })
    .await?;
    Ok(count)
}
