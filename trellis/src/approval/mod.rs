//! Approval queue: pending approvals keyed by the tool-call id they gate,
//! correlating operator resolutions with the blocked runner.

use dashmap::DashMap;
use run_event::Approval;

/// Where an approval originated, which decides how its resolution is
/// routed back: provider-raised approvals go to the adapter, engine-raised
/// ones are cached for the runner's own tool queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalOrigin {
    Adapter,
    ToolQueue,
}

#[derive(Clone, Debug)]
pub struct PendingApproval {
    pub approval: Approval,
    pub origin: ApprovalOrigin,
}

/// Id-keyed pending approvals across all runs.
#[derive(Default)]
pub struct ApprovalQueue {
    pending: DashMap<String, PendingApproval>,
}

impl ApprovalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, approval: Approval, origin: ApprovalOrigin) {
        self.pending
            .insert(approval.id.clone(), PendingApproval { approval, origin });
    }

    /// Takes the pending entry for resolution. `None` means the id is
    /// unknown (or already resolved) and the resolution is dropped with a
    /// warning by the caller.
    pub fn remove(&self, approval_id: &str) -> Option<PendingApproval> {
        self.pending.remove(approval_id).map(|(_, entry)| entry)
    }

    pub fn list_for_run(&self, run_id: &str) -> Vec<Approval> {
        let mut approvals: Vec<Approval> = self
            .pending
            .iter()
            .filter(|entry| entry.approval.run_id == run_id)
            .map(|entry| entry.approval.clone())
            .collect();
        approvals.sort_by(|a, b| a.id.cmp(&b.id));
        approvals
    }

    /// Drops every approval gated on a deleted node.
    pub fn drop_for_node(&self, node_id: &str) {
        self.pending.retain(|_, entry| entry.approval.node_id != node_id);
    }

    /// Drops every approval belonging to a deleted run.
    pub fn drop_for_run(&self, run_id: &str) {
        self.pending.retain(|_, entry| entry.approval.run_id != run_id);
    }
}
