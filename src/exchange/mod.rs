use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::market::Side;

pub mod paper;
pub mod retry;

/// Entry order as handed to the venue. Stop and target travel with the
/// order so a venue that supports brackets can attach them.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    /// Price the decision was made at
    pub reference_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    /// Idempotency key; also used to resolve ambiguous timeouts
    pub client_order_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub order_id: String,
    pub client_order_id: String,
}

/// Flatten request for an open position.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseRequest {
    pub symbol: String,
    /// Side of the position being closed
    pub side: Side,
    pub size: f64,
    pub reference_price: f64,
    pub handle: OrderHandle,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderStatus {
    Filled { price: f64 },
    Pending,
    Rejected { reason: String },
    /// The filled position behind this order has been flattened
    Closed { price: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseStatus {
    Closed { price: f64 },
    Pending,
    Rejected { reason: String },
}

/// Order-execution collaborator. Calls may hang; callers bound each one
/// with a timeout.
#[async_trait]
pub trait Execution: Send + Sync {
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderHandle>;

    async fn confirm_order(&self, handle: &OrderHandle) -> Result<OrderStatus>;

    async fn close_order(&self, req: &CloseRequest) -> Result<CloseStatus>;

    /// Look an order up by client id. `None` means the venue never saw it.
    async fn query_order(&self, symbol: &str, client_order_id: &str) -> Result<Option<(OrderHandle, OrderStatus)>>;
}
