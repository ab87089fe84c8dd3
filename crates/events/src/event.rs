use chrono::{DateTime, Utc};

/// A fact recorded by an order or inventory aggregate.
///
/// Implementors are plain enums; publication wraps them in an
/// [`EventEnvelope`](crate::EventEnvelope) together with the aggregate id and sequence number.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Dotted name such as `"sales.order.placed"` or `"inventory.stock.reserved"`.
    fn event_type(&self) -> &'static str;

    /// Payload schema version, bumped when the serialized shape changes.
    fn version(&self) -> u32;

    fn occurred_at(&self) -> DateTime<Utc>;
}
