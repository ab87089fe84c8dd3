use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ordercore_core::{
    Aggregate, AggregateRoot, DomainError, ErrorKind, ProductId, VariantId, WarehouseId,
};
use ordercore_events::Event;

/// Identity of an inventory record: one per (product, variant, warehouse).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InventoryKey {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub warehouse_id: WarehouseId,
}

impl InventoryKey {
    pub fn new(
        product_id: ProductId,
        variant_id: Option<VariantId>,
        warehouse_id: WarehouseId,
    ) -> Self {
        Self {
            product_id,
            variant_id,
            warehouse_id,
        }
    }

    /// Same product/variant, any warehouse.
    pub fn same_item(&self, product_id: ProductId, variant_id: Option<VariantId>) -> bool {
        self.product_id == product_id && self.variant_id == variant_id
    }
}

impl core::fmt::Display for InventoryKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.variant_id {
            Some(variant) => write!(f, "{}/{}@{}", self.product_id, variant, self.warehouse_id),
            None => write!(f, "{}@{}", self.product_id, self.warehouse_id),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InventoryError {
    #[error("quantity must be greater than zero (got {0})")]
    InvalidQuantity(i64),

    #[error("insufficient stock: requested {requested}, on hand {on_hand}")]
    InsufficientStock { requested: i64, on_hand: i64 },

    #[error("insufficient available stock: requested {requested}, available {available}")]
    InsufficientAvailableStock { requested: i64, available: i64 },

    #[error("cannot release {requested}: only {reserved} reserved")]
    OverRelease { requested: i64, reserved: i64 },

    #[error("cannot commit {requested}: only {reserved} reserved")]
    OverCommit { requested: i64, reserved: i64 },

    #[error("inventory record {0} has not received stock yet")]
    NotReceived(InventoryKey),

    #[error("inventory record {0} already exists")]
    AlreadyReceived(InventoryKey),

    #[error("command targets {found}, record is {expected}")]
    KeyMismatch {
        expected: InventoryKey,
        found: InventoryKey,
    },

    #[error("inventory record {key} still holds {quantity} units")]
    StillStocked { key: InventoryKey, quantity: i64 },
}

impl InventoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InventoryError::InvalidQuantity(_) | InventoryError::KeyMismatch { .. } => {
                ErrorKind::Validation
            }
            InventoryError::NotReceived(_) => ErrorKind::NotFound,
            InventoryError::AlreadyReceived(_) => ErrorKind::Conflict,
            InventoryError::InsufficientStock { .. }
            | InventoryError::InsufficientAvailableStock { .. }
            | InventoryError::OverRelease { .. }
            | InventoryError::OverCommit { .. }
            | InventoryError::StillStocked { .. } => ErrorKind::State,
        }
    }
}

impl From<InventoryError> for DomainError {
    fn from(value: InventoryError) -> Self {
        let msg = value.to_string();
        match value.kind() {
            ErrorKind::Validation => DomainError::Validation(msg),
            ErrorKind::NotFound => DomainError::NotFound(msg),
            ErrorKind::Conflict => DomainError::Conflict(msg),
            _ => DomainError::InvariantViolation(msg),
        }
    }
}

/// Aggregate root: stock of one product/variant in one warehouse.
///
/// Invariant, always: `0 <= reserved_quantity <= quantity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    key: InventoryKey,
    quantity: i64,
    reserved_quantity: i64,
    updated_at: DateTime<Utc>,
    version: u64,
    created: bool,
}

impl Inventory {
    /// Create an empty, not-yet-received record for rehydration.
    pub fn empty(key: InventoryKey) -> Self {
        Self {
            key,
            quantity: 0,
            reserved_quantity: 0,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
            version: 0,
            created: false,
        }
    }

    /// First receipt of stock for a location; this is how records come into existence.
    pub fn receive(key: InventoryKey, quantity: i64) -> Result<Self, InventoryError> {
        let mut inventory = Self::empty(key);
        inventory.execute(&InventoryCommand::Receive(QuantityChange::now(key, quantity)))?;
        Ok(inventory)
    }

    pub fn key(&self) -> InventoryKey {
        self.key
    }

    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn reserved_quantity(&self) -> i64 {
        self.reserved_quantity
    }

    pub fn available_quantity(&self) -> i64 {
        self.quantity - self.reserved_quantity
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_in_stock(&self) -> bool {
        self.available_quantity() > 0
    }

    pub fn can_fulfill(&self, quantity: i64) -> bool {
        self.available_quantity() >= quantity
    }

    /// Records may only be deleted once they hold nothing.
    pub fn ensure_removable(&self) -> Result<(), InventoryError> {
        if self.quantity > 0 {
            return Err(InventoryError::StillStocked {
                key: self.key,
                quantity: self.quantity,
            });
        }
        Ok(())
    }

    pub fn add_stock(&mut self, quantity: i64) -> Result<&Self, InventoryError> {
        self.run(InventoryCommand::AddStock, quantity)
    }

    pub fn remove_stock(&mut self, quantity: i64) -> Result<&Self, InventoryError> {
        self.run(InventoryCommand::RemoveStock, quantity)
    }

    pub fn reserve_stock(&mut self, quantity: i64) -> Result<&Self, InventoryError> {
        self.run(InventoryCommand::ReserveStock, quantity)
    }

    pub fn release_reserved_stock(&mut self, quantity: i64) -> Result<&Self, InventoryError> {
        self.run(InventoryCommand::ReleaseReservedStock, quantity)
    }

    pub fn commit_reserved_stock(&mut self, quantity: i64) -> Result<&Self, InventoryError> {
        self.run(InventoryCommand::CommitReservedStock, quantity)
    }

    fn run(
        &mut self,
        command: fn(QuantityChange) -> InventoryCommand,
        quantity: i64,
    ) -> Result<&Self, InventoryError> {
        self.execute(&command(QuantityChange::now(self.key, quantity)))?;
        Ok(self)
    }
}

impl AggregateRoot for Inventory {
    type Id = InventoryKey;

    fn id(&self) -> &Self::Id {
        &self.key
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Payload shared by every inventory command and event: which record, how many units, when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityChange {
    pub key: InventoryKey,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

impl QuantityChange {
    pub fn new(key: InventoryKey, quantity: i64, occurred_at: DateTime<Utc>) -> Self {
        Self {
            key,
            quantity,
            occurred_at,
        }
    }

    pub fn now(key: InventoryKey, quantity: i64) -> Self {
        Self::new(key, quantity, Utc::now())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryCommand {
    Receive(QuantityChange),
    AddStock(QuantityChange),
    RemoveStock(QuantityChange),
    ReserveStock(QuantityChange),
    ReleaseReservedStock(QuantityChange),
    CommitReservedStock(QuantityChange),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryEvent {
    StockReceived(QuantityChange),
    StockAdded(QuantityChange),
    StockRemoved(QuantityChange),
    StockReserved(QuantityChange),
    ReservationReleased(QuantityChange),
    /// Reserved and on-hand quantities drop together; never observable separately.
    ReservationCommitted(QuantityChange),
}

impl InventoryEvent {
    pub fn change(&self) -> &QuantityChange {
        match self {
            InventoryEvent::StockReceived(c)
            | InventoryEvent::StockAdded(c)
            | InventoryEvent::StockRemoved(c)
            | InventoryEvent::StockReserved(c)
            | InventoryEvent::ReservationReleased(c)
            | InventoryEvent::ReservationCommitted(c) => c,
        }
    }
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::StockReceived(_) => "inventory.stock.received",
            InventoryEvent::StockAdded(_) => "inventory.stock.added",
            InventoryEvent::StockRemoved(_) => "inventory.stock.removed",
            InventoryEvent::StockReserved(_) => "inventory.stock.reserved",
            InventoryEvent::ReservationReleased(_) => "inventory.reservation.released",
            InventoryEvent::ReservationCommitted(_) => "inventory.reservation.committed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.change().occurred_at
    }
}

impl Aggregate for Inventory {
    type Command = InventoryCommand;
    type Event = InventoryEvent;
    type Error = InventoryError;

    fn apply(&mut self, event: &Self::Event) {
        let change = event.change();
        match event {
            InventoryEvent::StockReceived(_) => {
                self.key = change.key;
                self.quantity = change.quantity;
                self.reserved_quantity = 0;
                self.created = true;
            }
            InventoryEvent::StockAdded(_) => self.quantity += change.quantity,
            InventoryEvent::StockRemoved(_) => self.quantity -= change.quantity,
            InventoryEvent::StockReserved(_) => self.reserved_quantity += change.quantity,
            InventoryEvent::ReservationReleased(_) => self.reserved_quantity -= change.quantity,
            InventoryEvent::ReservationCommitted(_) => {
                self.reserved_quantity -= change.quantity;
                self.quantity -= change.quantity;
            }
        }

        self.updated_at = change.occurred_at;
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let event = match command {
            InventoryCommand::Receive(c) => {
                if self.created {
                    return Err(InventoryError::AlreadyReceived(self.key));
                }
                self.ensure_key(c)?;
                ensure_positive(c.quantity)?;
                InventoryEvent::StockReceived(c.clone())
            }
            InventoryCommand::AddStock(c) => {
                self.ensure_ready(c)?;
                if self.quantity.checked_add(c.quantity).is_none() {
                    return Err(InventoryError::InvalidQuantity(c.quantity));
                }
                InventoryEvent::StockAdded(c.clone())
            }
            InventoryCommand::RemoveStock(c) => {
                self.ensure_ready(c)?;
                if self.quantity < c.quantity {
                    return Err(InventoryError::InsufficientStock {
                        requested: c.quantity,
                        on_hand: self.quantity,
                    });
                }
                // Held units stay put; reserved may never exceed on-hand.
                if !self.can_fulfill(c.quantity) {
                    return Err(InventoryError::InsufficientAvailableStock {
                        requested: c.quantity,
                        available: self.available_quantity(),
                    });
                }
                InventoryEvent::StockRemoved(c.clone())
            }
            InventoryCommand::ReserveStock(c) => {
                self.ensure_ready(c)?;
                // Checked against available, not on-hand: held units cannot be sold twice.
                if !self.can_fulfill(c.quantity) {
                    return Err(InventoryError::InsufficientAvailableStock {
                        requested: c.quantity,
                        available: self.available_quantity(),
                    });
                }
                InventoryEvent::StockReserved(c.clone())
            }
            InventoryCommand::ReleaseReservedStock(c) => {
                self.ensure_ready(c)?;
                if self.reserved_quantity < c.quantity {
                    return Err(InventoryError::OverRelease {
                        requested: c.quantity,
                        reserved: self.reserved_quantity,
                    });
                }
                InventoryEvent::ReservationReleased(c.clone())
            }
            InventoryCommand::CommitReservedStock(c) => {
                self.ensure_ready(c)?;
                if self.reserved_quantity < c.quantity {
                    return Err(InventoryError::OverCommit {
                        requested: c.quantity,
                        reserved: self.reserved_quantity,
                    });
                }
                InventoryEvent::ReservationCommitted(c.clone())
            }
        };

        Ok(vec![event])
    }
}

impl Inventory {
    fn ensure_key(&self, change: &QuantityChange) -> Result<(), InventoryError> {
        if self.key != change.key {
            return Err(InventoryError::KeyMismatch {
                expected: self.key,
                found: change.key,
            });
        }
        Ok(())
    }

    fn ensure_ready(&self, change: &QuantityChange) -> Result<(), InventoryError> {
        if !self.created {
            return Err(InventoryError::NotReceived(self.key));
        }
        self.ensure_key(change)?;
        ensure_positive(change.quantity)
    }
}

fn ensure_positive(quantity: i64) -> Result<(), InventoryError> {
    if quantity <= 0 {
        return Err(InventoryError::InvalidQuantity(quantity));
    }
    Ok(())
}
