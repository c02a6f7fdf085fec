//! Cluster-wide advisory lock over the shared key-value store.
//!
//! Some provisioning actions (the directory schema push) must be serialized
//! across every node of the cluster even though each node runs this tool
//! independently. The protocol is a polling observe-then-write loop, not a
//! compare-and-swap: two nodes can both observe the key empty and both write,
//! and whichever write lands last wins. Ownership is therefore only believed
//! after re-reading our own id, which keeps the protocol safe (at most one
//! proceeds) though not fair. There is no lease or timeout: a holder that
//! dies wedges the cluster at this step until an operator deletes the record,
//! which is accepted for a step that runs once at install time under
//! supervision. We log the holder id on every poll so the stale record is
//! easy to find.

use crate::error::{StevedoreError, StevedoreResult};
use crate::store::KvStore;
use log::{error, info};
use std::thread;
use std::time::Duration;

/// Advisory polling lock on one key of the shared store.
pub struct ClusterLock<'a> {
    kv: &'a dyn KvStore,
    key: String,
    node_id: String,
    poll_delay: Duration,
}

impl<'a> ClusterLock<'a> {
    pub fn new(kv: &'a dyn KvStore, key: &str, node_id: &str, poll_delay: Duration) -> Self {
        Self {
            kv,
            key: key.to_string(),
            node_id: node_id.to_string(),
            poll_delay,
        }
    }

    /// Poll until this node is the recorded holder.
    ///
    /// Fails with [`StevedoreError::CoordinationIo`] if the store becomes
    /// unreachable; the caller then skips the protected action for this run
    /// instead of retrying forever.
    pub fn acquire(&self) -> StevedoreResult<()> {
        loop {
            let observed = self
                .kv
                .get(&self.key)
                .map_err(|err| StevedoreError::CoordinationIo(err.to_string()))?;
            match observed.as_deref() {
                None | Some("") => {
                    info!(
                        "coordination key '{}' is unheld; recording node {}",
                        self.key, self.node_id
                    );
                    self.kv
                        .set(&self.key, &self.node_id, true)
                        .map_err(|err| StevedoreError::CoordinationIo(err.to_string()))?;
                    // The write raced nothing we can see, but it is not
                    // atomic with the read: confirm ownership on the next
                    // observation instead of assuming it.
                    thread::sleep(self.poll_delay);
                }
                Some(holder) if holder == self.node_id => {
                    info!(
                        "coordination key '{}' records this node; lock acquired",
                        self.key
                    );
                    return Ok(());
                }
                Some(holder) => {
                    info!(
                        "coordination key '{}' is held by {holder}; waiting",
                        self.key
                    );
                    thread::sleep(self.poll_delay);
                }
            }
        }
    }

    /// Delete the lock record, releasing the next waiting node.
    pub fn release(&self) -> StevedoreResult<()> {
        self.kv
            .delete(&self.key, true)
            .map_err(|err| StevedoreError::CoordinationIo(err.to_string()))?;
        info!("coordination key '{}' released", self.key);
        Ok(())
    }
}

/// Run `action` under the cluster lock for `key`.
///
/// Returns `Ok(true)` when the action ran and the lock was released, and
/// `Ok(false)` when a coordination I/O failure made this node skip the
/// protected action (fail open in the "don't act" direction). Errors from
/// `action` itself propagate; the lock record is still deleted so the
/// cluster is not wedged by a failed attempt that will be retried on re-run.
pub fn with_cluster_lock(
    kv: &dyn KvStore,
    key: &str,
    node_id: &str,
    poll_delay: Duration,
    action: impl FnOnce() -> StevedoreResult<()>,
) -> StevedoreResult<bool> {
    let lock = ClusterLock::new(kv, key, node_id, poll_delay);
    match lock.acquire() {
        Ok(()) => {}
        Err(StevedoreError::CoordinationIo(reason)) => {
            error!("skipping cluster-exclusive action for '{key}': {reason}");
            return Ok(false);
        }
        Err(other) => return Err(other),
    }

    let outcome = action();
    lock.release()?;
    outcome.map(|()| true)
}
