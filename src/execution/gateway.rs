use async_trait::async_trait;
use crate::execution::types::{OrderAck, OrderRequest};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("order {client_order_id} timed out after {secs}s")]
    Timeout { client_order_id: String, secs: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("order not found: {0}")]
    NotFound(String),

    #[error("order {client_order_id} state unknown after re-query")]
    Unreconciled { client_order_id: String },
}

impl GatewayError {
    /// The order may have reached the exchange; its state must be re-queried.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, GatewayError::Timeout { .. } | GatewayError::Transport(_))
    }
}

/// Exchange seam. Live transport and authentication are supplied by the deployment.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, GatewayError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError>;

    /// `Ok(None)` means the exchange has no order under that client id.
    async fn order_status(&self, client_order_id: &str) -> Result<Option<OrderAck>, GatewayError>;

    async fn balance(&self) -> Result<f64, GatewayError>;

    /// Settlement payout; exchanges that settle on their own ignore it.
    async fn credit_settlement(&self, _amount: f64) -> Result<(), GatewayError> {
        Ok(())
    }
}
