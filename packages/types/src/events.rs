use serde::{Deserialize, Serialize};

use crate::{BudgetId, ExecutionId, ServerId, WorkflowId};

/// The closed set of domain events the bus carries. Kind strings are the
/// wire names webhook subscriptions match against.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(
    tag = "kind",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum GatewayEvent {
    ServerConnected {
        server_id: ServerId,
        server_name: String,
    },
    ServerDisconnected {
        server_id: ServerId,
        server_name: String,
    },
    ServerError {
        server_id: ServerId,
        error: String,
    },
    ToolInvoked {
        server_id: ServerId,
        tool_name: String,
        duration_ms: u64,
    },
    ToolFailed {
        server_id: ServerId,
        tool_name: String,
        error: String,
        duration_ms: u64,
    },
    CircuitOpened {
        server_id: ServerId,
    },
    CircuitClosed {
        server_id: ServerId,
    },
    CircuitHalfOpen {
        server_id: ServerId,
    },
    WorkflowStarted {
        workflow_id: WorkflowId,
        execution_id: ExecutionId,
    },
    WorkflowCompleted {
        workflow_id: WorkflowId,
        execution_id: ExecutionId,
        duration_ms: u64,
    },
    WorkflowFailed {
        workflow_id: WorkflowId,
        execution_id: ExecutionId,
        error: String,
    },
    WorkflowPausedBudget {
        workflow_id: WorkflowId,
        budget_id: BudgetId,
    },
    BudgetThreshold50Reached {
        budget_id: BudgetId,
        percentage_used: f64,
    },
    BudgetThreshold75Reached {
        budget_id: BudgetId,
        percentage_used: f64,
    },
    BudgetThreshold90Reached {
        budget_id: BudgetId,
        percentage_used: f64,
    },
    BudgetExceeded {
        budget_id: BudgetId,
        percentage_used: f64,
    },
}

impl GatewayEvent {
    /// Wire name of this event, e.g. `server.connected`.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayEvent::ServerConnected { .. } => "server.connected",
            GatewayEvent::ServerDisconnected { .. } => "server.disconnected",
            GatewayEvent::ServerError { .. } => "server.error",
            GatewayEvent::ToolInvoked { .. } => "tool.invoked",
            GatewayEvent::ToolFailed { .. } => "tool.failed",
            GatewayEvent::CircuitOpened { .. } => "circuit.opened",
            GatewayEvent::CircuitClosed { .. } => "circuit.closed",
            GatewayEvent::CircuitHalfOpen { .. } => "circuit.half_open",
            GatewayEvent::WorkflowStarted { .. } => "workflow.started",
            GatewayEvent::WorkflowCompleted { .. } => "workflow.completed",
            GatewayEvent::WorkflowFailed { .. } => "workflow.failed",
            GatewayEvent::WorkflowPausedBudget { .. } => "workflow.paused_budget",
            GatewayEvent::BudgetThreshold50Reached { .. } => "budget.threshold_50_reached",
            GatewayEvent::BudgetThreshold75Reached { .. } => "budget.threshold_75_reached",
            GatewayEvent::BudgetThreshold90Reached { .. } => "budget.threshold_90_reached",
            GatewayEvent::BudgetExceeded { .. } => "budget.exceeded",
        }
    }

    /// The server this event concerns, when it concerns one. Used by
    /// webhook subscription server filters.
    pub fn server_id(&self) -> Option<&ServerId> {
        match self {
            GatewayEvent::ServerConnected { server_id, .. }
            | GatewayEvent::ServerDisconnected { server_id, .. }
            | GatewayEvent::ServerError { server_id, .. }
            | GatewayEvent::ToolInvoked { server_id, .. }
            | GatewayEvent::ToolFailed { server_id, .. }
            | GatewayEvent::CircuitOpened { server_id }
            | GatewayEvent::CircuitClosed { server_id }
            | GatewayEvent::CircuitHalfOpen { server_id } => Some(server_id),
            _ => None,
        }
    }

    /// Event payload as it appears in webhook bodies.
    pub fn payload(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map
                .get("data")
                .cloned()
                .unwrap_or(serde_json::Value::Object(Default::default())),
            _ => serde_json::Value::Object(Default::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        let ev = GatewayEvent::CircuitHalfOpen {
            server_id: ServerId::new("srv-a1").unwrap(),
        };
        assert_eq!(ev.kind(), "circuit.half_open");

        let ev = GatewayEvent::BudgetThreshold75Reached {
            budget_id: BudgetId::new("bud-1").unwrap(),
            percentage_used: 80.0,
        };
        assert_eq!(ev.kind(), "budget.threshold_75_reached");
    }

    #[test]
    fn payload_strips_tag() {
        let ev = GatewayEvent::ServerConnected {
            server_id: ServerId::new("srv-a1").unwrap(),
            server_name: "alpha".to_string(),
        };
        let payload = ev.payload();
        assert_eq!(payload["serverName"], "alpha");
        assert!(payload.get("kind").is_none());
    }
}
