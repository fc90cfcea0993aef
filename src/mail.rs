//! Outbound mail queue seam.
//!
//! The engine only drains mail opportunistically, with whatever budget is
//! left after the task queue. The actual queue lives in the forum server;
//! deployments without one use [`NullMailQueue`].

use anyhow::Result;

pub trait MailQueue: Send + Sync {
    fn has_pending_work(&self) -> bool;
    /// Send one batch of queued mail. Returns the number of messages sent.
    fn drain_one_batch(&self) -> Result<usize>;
}

/// No-op queue for deployments without outbound mail.
pub struct NullMailQueue;

impl MailQueue for NullMailQueue {
    fn has_pending_work(&self) -> bool {
        false
    }

    fn drain_one_batch(&self) -> Result<usize> {
        Ok(0)
    }
}
