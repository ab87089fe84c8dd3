use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ordercore_core::{Entity, OrderId, ShipmentId};

use crate::error::OrderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShipmentStatus {
    Pending,
    Shipped,
    Delivered,
    Failed,
}

impl ShipmentStatus {
    pub fn can_transition_to(self, target: ShipmentStatus) -> bool {
        matches!(
            (self, target),
            (ShipmentStatus::Pending, ShipmentStatus::Shipped)
                | (ShipmentStatus::Shipped, ShipmentStatus::Delivered)
                | (ShipmentStatus::Pending | ShipmentStatus::Shipped, ShipmentStatus::Failed)
        )
    }
}

impl fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShipmentStatus::Pending => "pending",
            ShipmentStatus::Shipped => "shipped",
            ShipmentStatus::Delivered => "delivered",
            ShipmentStatus::Failed => "failed",
        })
    }
}

/// A physical shipment of an order. Owned by the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shipment {
    pub id: ShipmentId,
    pub order_id: OrderId,
    pub tracking_number: String,
    pub carrier: String,
    pub status: ShipmentStatus,
    pub shipping_date: Option<DateTime<Utc>>,
    pub expected_delivery_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Shipment {
    type Id = ShipmentId;

    fn id(&self) -> &ShipmentId {
        &self.id
    }
}

impl Shipment {
    pub fn new(
        id: ShipmentId,
        order_id: OrderId,
        tracking_number: impl Into<String>,
        carrier: impl Into<String>,
        expected_delivery_date: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, OrderError> {
        let tracking_number = tracking_number.into();
        let carrier = carrier.into();
        if tracking_number.trim().is_empty() {
            return Err(OrderError::validation("tracking number is required"));
        }
        if carrier.trim().is_empty() {
            return Err(OrderError::validation("carrier is required"));
        }

        Ok(Self {
            id,
            order_id,
            tracking_number,
            carrier,
            status: ShipmentStatus::Pending,
            shipping_date: None,
            expected_delivery_date,
            created_at,
            updated_at: created_at,
        })
    }

    pub fn ensure_transition(&self, target: ShipmentStatus) -> Result<(), OrderError> {
        if !self.status.can_transition_to(target) {
            return Err(OrderError::InvalidShipmentTransition {
                from: self.status,
                to: target,
            });
        }
        Ok(())
    }

    pub fn mark_as_shipped(&mut self, at: DateTime<Utc>) -> Result<(), OrderError> {
        self.transition(ShipmentStatus::Shipped, at)
    }

    pub fn mark_as_delivered(&mut self, at: DateTime<Utc>) -> Result<(), OrderError> {
        self.transition(ShipmentStatus::Delivered, at)
    }

    pub fn mark_as_failed(&mut self, at: DateTime<Utc>) -> Result<(), OrderError> {
        self.transition(ShipmentStatus::Failed, at)
    }

    fn transition(&mut self, target: ShipmentStatus, at: DateTime<Utc>) -> Result<(), OrderError> {
        self.ensure_transition(target)?;
        self.set_status(target, at);
        Ok(())
    }

    /// Unchecked; callers validate with [`Shipment::ensure_transition`] first.
    pub(crate) fn set_status(&mut self, status: ShipmentStatus, at: DateTime<Utc>) {
        self.status = status;
        self.updated_at = at;
        if status == ShipmentStatus::Shipped {
            self.shipping_date = Some(at);
        }
    }
}
