//! Authentication token supply.
//!
//! Token issuance is handled elsewhere. The subscription presents whatever
//! token the provider hands out during the service handshake, and writes a
//! re-authentication message whenever the provider has a fresher one.

use parking_lot::Mutex;
use std::fmt;

/// Supplies authentication tokens to a subscription.
pub trait AuthTokenProvider: Send + Sync + fmt::Debug {
    /// Token presented in the service handshake, `None` if security is off.
    fn initial_token(&self) -> Option<Vec<u8>>;

    /// A token fresher than the last one presented, if one is available.
    fn renewed_token(&self) -> Option<Vec<u8>>;
}

/// Provider for feeders that do not require authentication.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

impl AuthTokenProvider for NoAuth {
    fn initial_token(&self) -> Option<Vec<u8>> {
        None
    }

    fn renewed_token(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Provider holding a token that the application can replace at any time.
///
/// A replaced token is handed out once by `renewed_token`, then considered
/// presented.
#[derive(Debug)]
pub struct RenewableToken {
    current: Mutex<Vec<u8>>,
    renewed: Mutex<Option<Vec<u8>>>,
}

impl RenewableToken {
    /// Creates a provider with an initial token.
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        Self {
            current: Mutex::new(token.into()),
            renewed: Mutex::new(None),
        }
    }

    /// Replaces the token. The next re-authentication presents it.
    pub fn renew(&self, token: impl Into<Vec<u8>>) {
        let token = token.into();
        *self.current.lock() = token.clone();
        *self.renewed.lock() = Some(token);
    }
}

impl AuthTokenProvider for RenewableToken {
    fn initial_token(&self) -> Option<Vec<u8>> {
        Some(self.current.lock().clone())
    }

    fn renewed_token(&self) -> Option<Vec<u8>> {
        self.renewed.lock().take()
    }
}
