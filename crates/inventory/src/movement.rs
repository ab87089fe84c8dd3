use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ordercore_core::StaffId;

use crate::stock::{InventoryError, InventoryKey};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    In,
    Out,
    Transfer,
}

/// What caused a stock movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    PurchaseOrder,
    Order,
    Adjustment,
    Return,
    Transfer,
}

/// Append-only audit record of a change to on-hand stock.
///
/// Reservations do not produce movements; only receipts, adjustments and
/// committed reservations (shipments) do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: Uuid,
    pub key: InventoryKey,
    pub quantity: i64,
    pub movement_type: MovementType,
    pub reference_type: ReferenceType,
    pub reference_id: Option<String>,
    pub notes: String,
    pub staff_id: Option<StaffId>,
    pub created_at: DateTime<Utc>,
}

impl StockMovement {
    pub fn inbound(
        key: InventoryKey,
        quantity: i64,
        reference_type: ReferenceType,
    ) -> Result<Self, InventoryError> {
        Self::new(key, quantity, MovementType::In, reference_type)
    }

    pub fn outbound(
        key: InventoryKey,
        quantity: i64,
        reference_type: ReferenceType,
    ) -> Result<Self, InventoryError> {
        Self::new(key, quantity, MovementType::Out, reference_type)
    }

    fn new(
        key: InventoryKey,
        quantity: i64,
        movement_type: MovementType,
        reference_type: ReferenceType,
    ) -> Result<Self, InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidQuantity(quantity));
        }
        Ok(Self {
            id: Uuid::now_v7(),
            key,
            quantity,
            movement_type,
            reference_type,
            reference_id: None,
            notes: String::new(),
            staff_id: None,
            created_at: Utc::now(),
        })
    }

    pub fn with_reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn with_staff(mut self, staff_id: Option<StaffId>) -> Self {
        self.staff_id = staff_id;
        self
    }

    /// Signed effect on on-hand quantity.
    pub fn delta(&self) -> i64 {
        match self.movement_type {
            MovementType::In => self.quantity,
            MovementType::Out => -self.quantity,
            MovementType::Transfer => 0,
        }
    }
}
