//! Fault injection points.
//!
//! Tests pass a `FaultInjector` in the configuration to force failures at
//! points that are otherwise hard to reach. Production code uses
//! [`NoFaults`].

use crate::error::SubscriptionResult;
use crate::writer::OutputToken;
use std::fmt;

/// Injectable failure hooks.
pub trait FaultInjector: Send + Sync + fmt::Debug {
    /// Called before a feeder-accepted filter change is mirrored locally.
    /// An error makes the local application fail.
    fn before_filter_apply(&self, _request_id: &str) -> SubscriptionResult<()> {
        Ok(())
    }

    /// Called before the writer handles a token. An error is reported as
    /// the writer's failure.
    fn before_write(&self, _token: &OutputToken) -> SubscriptionResult<()> {
        Ok(())
    }
}

/// Injector that never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultInjector for NoFaults {}
