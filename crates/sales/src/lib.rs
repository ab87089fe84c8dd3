//! Orders domain module (event-sourced).
//!
//! The `Order` aggregate with its owned items, status history, shipments and payment
//! transactions, implemented purely as deterministic domain logic (no IO, no storage).

pub mod error;
pub mod item;
pub mod order;
pub mod payment;
pub mod shipment;
pub mod status;

pub use error::OrderError;
pub use item::{NewOrderItem, OrderItem, OrderStatusHistory, OrderTotals};
pub use order::{
    AddItem, AddShipment, CancelOrder, ChangeStatus, Charge, FailShipment, MarkDelivered, Order,
    OrderCommand, OrderEvent, PlaceOrder, RecordPayment, RemoveItem, SetCharge, UpdateItem,
    UpdatePaymentStatus,
};
pub use payment::{FeesType, PaymentMethod, Transaction};
pub use shipment::{Shipment, ShipmentStatus};
pub use status::{OrderStatus, PaymentStatus, UnknownStatus};
