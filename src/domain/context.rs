//! Operation Context
//!
//! Tenant scope and tracing metadata for the current operation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Context for an operation: which group/entity it acts on and who asked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationContext {
    /// Tenant owning the chart of accounts
    pub group_id: Uuid,

    /// Operating/legal unit the operation is scoped to
    pub entity_id: Uuid,

    /// User performing the operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<Uuid>,

    /// Correlation ID for request tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl OperationContext {
    /// Create a context scoped to one entity of a group
    pub fn new(group_id: Uuid, entity_id: Uuid) -> Self {
        Self {
            group_id,
            entity_id,
            actor_id: None,
            correlation_id: None,
        }
    }

    /// Create context with the acting user
    pub fn with_actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    /// Create context with correlation ID
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_builder() {
        let group_id = Uuid::new_v4();
        let entity_id = Uuid::new_v4();
        let actor_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();

        let context = OperationContext::new(group_id, entity_id)
            .with_actor(actor_id)
            .with_correlation_id(correlation_id);

        assert_eq!(context.group_id, group_id);
        assert_eq!(context.entity_id, entity_id);
        assert_eq!(context.actor_id, Some(actor_id));
        assert_eq!(context.correlation_id, Some(correlation_id));
    }
}
