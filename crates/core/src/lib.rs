//! `ordercore-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the `Money` value type, aggregate traits and the error taxonomy.

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;
pub mod money;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use entity::Entity;
pub use error::{DomainError, DomainResult, ErrorKind};
pub use id::{
    AddressId, CustomerId, DocumentId, OrderId, OrderItemId, PaymentMethodId, ProductId,
    ShipmentId, StaffId, TransactionId, VariantId, WarehouseId,
};
pub use money::{Money, MoneyError};
