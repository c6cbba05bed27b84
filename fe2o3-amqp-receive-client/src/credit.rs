//! Credit based flow control of the receive link
//!
//! The controller is a small integer state machine. It decides *when* and *how much* credit
//! should be issued; the only I/O it performs is a single `set_credit` on the link.

use tracing::trace;

use crate::{error::ConnectionError, transport::LinkReceiver};

/// When outstanding credit is topped up
///
/// Credit is replenished once the outstanding credit falls at or below `low_water_mark`.
/// The default of `0` waits until the broker has used up all credit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplenishPolicy {
    /// Replenish when outstanding credit is at or below this value
    pub low_water_mark: u32,
}

impl ReplenishPolicy {
    /// Creates a policy with the given low-water mark
    pub fn new(low_water_mark: u32) -> Self {
        Self { low_water_mark }
    }

    /// Replenish once half of the prefetch has been consumed
    pub fn half_of(prefetch: u32) -> Self {
        Self {
            low_water_mark: prefetch / 2,
        }
    }
}

/// Tracks how much link credit the receiver has granted the broker
#[derive(Debug, Clone)]
pub struct CreditFlowController {
    policy: ReplenishPolicy,

    /// Steady-state credit
    prefetch: u32,

    /// Credit restored on replenish. Equal to `prefetch` unless a batch raised it
    target: u32,

    /// Credit the broker may still use
    outstanding: u32,
}

impl CreditFlowController {
    /// Creates a controller with no credit issued
    pub fn new(policy: ReplenishPolicy) -> Self {
        Self {
            policy,
            prefetch: 0,
            target: 0,
            outstanding: 0,
        }
    }

    /// Steady-state credit
    pub fn prefetch(&self) -> u32 {
        self.prefetch
    }

    /// Credit restored on the next replenish
    pub fn target(&self) -> u32 {
        self.target
    }

    /// Credit the broker may still use
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    /// Set the starting credit. Returns the credit that should be issued on the link
    pub fn initial_credit(&mut self, prefetch: u32) -> u32 {
        self.prefetch = prefetch;
        self.target = prefetch;
        prefetch
    }

    /// Account for one delivered message
    pub fn on_message_delivered(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Whether the outstanding credit fell to the low-water mark
    pub fn should_replenish(&self) -> bool {
        self.outstanding <= self.policy.low_water_mark && self.outstanding < self.target
    }

    /// Raise the credit to at least `n` until [`restore`](#method.restore) is called.
    ///
    /// Returns the credit to issue if the outstanding credit is below `n`
    pub fn raise_to(&mut self, n: u32) -> Option<u32> {
        self.target = self.prefetch.max(n);
        (self.outstanding < n).then_some(n)
    }

    /// Return to the steady-state target.
    ///
    /// Returns the credit to issue if the outstanding credit is above the prefetch
    pub fn restore(&mut self) -> Option<u32> {
        self.target = self.prefetch;
        (self.outstanding > self.prefetch).then_some(self.prefetch)
    }

    /// Issue `credit` on the link
    pub async fn issue<L>(&mut self, link: &mut L, credit: u32) -> Result<(), ConnectionError>
    where
        L: LinkReceiver + ?Sized,
    {
        link.set_credit(credit).await?;
        trace!(credit, previous = self.outstanding, "credit issued");
        self.outstanding = credit;
        Ok(())
    }

    /// Restore the outstanding credit to the target
    pub async fn replenish<L>(&mut self, link: &mut L) -> Result<(), ConnectionError>
    where
        L: LinkReceiver + ?Sized,
    {
        let credit = self.target;
        self.issue(link, credit).await
    }
}
