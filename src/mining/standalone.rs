//! Single-node validation path, used when the committee degenerates to one
//! member (bootstrap or tiny networks). No cross-validation round: the
//! stamp is produced, left without counter-signatures, and replicated
//! directly.

use tokio::sync::mpsc;
use tracing::info;

use crate::errors::ChainResult;

use super::workflow::{assemble_stamp, build_trees, replicate, MiningJob, WorkflowDeps};
use super::WorkflowEvent;

pub async fn run_standalone(
    deps: &WorkflowDeps,
    job: &MiningJob,
    mut events: mpsc::UnboundedReceiver<WorkflowEvent>,
) -> ChainResult<()> {
    info!(address = %job.tx.address, "standalone validation");
    let stamp = assemble_stamp(deps, job)?;
    let trees = build_trees(job);
    replicate(deps, job, stamp, Vec::new(), &trees, Vec::new(), &mut events).await
}
