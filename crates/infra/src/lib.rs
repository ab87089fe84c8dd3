//! Infrastructure layer: order workflows and their adapters.
//!
//! - `orders`: the `OrderService` coordinating the order and inventory aggregates
//! - `repository`: storage traits with optimistic versioning + in-memory stores
//! - `external`: collaborator traits (customers, catalog, payment methods, documents)
//! - `saga`: compensation stack for multi-aggregate workflows
//! - `config`: environment-driven configuration

pub mod config;
pub mod external;
pub mod orders;
pub mod repository;
pub mod saga;

pub use config::{ConfigError, OrderingConfig};
pub use orders::{
    AddItemRequest, Collaborators, NewOrder, OrderService, OrderServiceError, PaymentDetails,
    ShipmentRequest, StockChange, Stores,
};
pub use repository::{Page, Reservation, StoreError};
