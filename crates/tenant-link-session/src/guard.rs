//! Guard against concurrent initialization of the same tenant.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

use tenant_link_core::TenantId;

/// Set of tenants currently mid-initialization.
#[derive(Clone, Default)]
pub struct InitializationGuard {
    in_flight: Arc<Mutex<HashSet<TenantId>>>,
}

impl InitializationGuard {
    /// Create an empty guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a tenant. Returns `None` if it is already claimed.
    ///
    /// The claim is released when the returned ticket is dropped.
    #[must_use]
    pub fn try_acquire(&self, tenant: &TenantId) -> Option<InitTicket> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant.clone());

        inserted.then(|| InitTicket {
            guard: self.clone(),
            tenant: tenant.clone(),
        })
    }

    /// Whether a tenant is mid-initialization.
    #[must_use]
    pub fn is_held(&self, tenant: &TenantId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(tenant)
    }
}

/// Claim on one tenant's initialization slot.
#[must_use = "the claim is released as soon as the ticket is dropped"]
pub struct InitTicket {
    guard: InitializationGuard,
    tenant: TenantId,
}

impl Drop for InitTicket {
    fn drop(&mut self) {
        self.guard
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.tenant);
    }
}
