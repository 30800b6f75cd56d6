use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{ApiKeyId, TenantId};

/// The authenticated caller, derived from an API key at the HTTP boundary.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// None when authenticated with the master key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<ApiKeyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    pub is_master: bool,
}

impl Principal {
    pub fn master() -> Self {
        Self {
            api_key_id: None,
            tenant_id: None,
            is_master: true,
        }
    }
}

/// Explicit per-request values threaded into every kernel call; replaces
/// hidden request-scoped state.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub principal: Principal,
    pub request_id: String,
    /// Absolute deadline; network calls made under this context must not
    /// outlive it.
    pub deadline: Option<DateTime<Utc>>,
}

impl RequestContext {
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            deadline: None,
        }
    }

    /// Internal context for background work (health checks, workflow
    /// steps) that is not tied to an HTTP caller.
    pub fn system() -> Self {
        Self::new(Principal::master())
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Remaining time until the deadline, clamped at zero.
    pub fn time_remaining(&self) -> Option<std::time::Duration> {
        self.deadline.map(|d| {
            (d - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO)
        })
    }
}
