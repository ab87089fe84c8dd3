use thiserror::Error;

use ordercore_core::{DomainError, ErrorKind, MoneyError, OrderItemId, ShipmentId};

use crate::shipment::ShipmentStatus;
use crate::status::OrderStatus;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrderError {
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("order can only be modified while pending (status: {0})")]
    NotPending(OrderStatus),

    #[error("cannot cancel a delivered order")]
    DeliveredCannotBeCancelled,

    #[error("can only add shipment to processing orders (status: {0})")]
    NotProcessing(OrderStatus),

    #[error("can only deliver shipped orders (status: {0})")]
    NotShipped(OrderStatus),

    #[error("order is closed (status: {0})")]
    Closed(OrderStatus),

    #[error("order is already paid")]
    AlreadyPaid,

    #[error("order item {0} not found")]
    ItemNotFound(OrderItemId),

    #[error("order item {0} already exists")]
    DuplicateItem(OrderItemId),

    #[error("shipment {0} not found")]
    ShipmentNotFound(ShipmentId),

    #[error("shipment cannot go from {from} to {to}")]
    InvalidShipmentTransition {
        from: ShipmentStatus,
        to: ShipmentStatus,
    },

    #[error("quantity must be greater than zero (got {0})")]
    InvalidQuantity(i64),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Money(#[from] MoneyError),
}

impl OrderError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OrderError::InvalidQuantity(_) | OrderError::Validation(_) => ErrorKind::Validation,
            OrderError::ItemNotFound(_) | OrderError::ShipmentNotFound(_) => ErrorKind::NotFound,
            OrderError::DuplicateItem(_) => ErrorKind::Conflict,
            OrderError::Money(e) => e.kind(),
            OrderError::InvalidTransition { .. }
            | OrderError::NotPending(_)
            | OrderError::DeliveredCannotBeCancelled
            | OrderError::NotProcessing(_)
            | OrderError::NotShipped(_)
            | OrderError::Closed(_)
            | OrderError::AlreadyPaid
            | OrderError::InvalidShipmentTransition { .. } => ErrorKind::State,
        }
    }
}

impl From<OrderError> for DomainError {
    fn from(value: OrderError) -> Self {
        if let OrderError::Money(e) = value {
            return e.into();
        }
        let msg = value.to_string();
        match value.kind() {
            ErrorKind::Validation => DomainError::Validation(msg),
            ErrorKind::NotFound => DomainError::NotFound(msg),
            ErrorKind::Conflict => DomainError::Conflict(msg),
            _ => DomainError::InvariantViolation(msg),
        }
    }
}
