//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $t:ident, $name:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(Uuid);

        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

uuid_newtype!(
    /// Identifier of an order (aggregate root).
    OrderId,
    "OrderId"
);
uuid_newtype!(
    /// Identifier of a line item inside an order.
    OrderItemId,
    "OrderItemId"
);
uuid_newtype!(ShipmentId, "ShipmentId");
uuid_newtype!(TransactionId, "TransactionId");
uuid_newtype!(CustomerId, "CustomerId");
uuid_newtype!(
    /// Identifier of a customer address (shipping or billing).
    AddressId,
    "AddressId"
);
uuid_newtype!(PaymentMethodId, "PaymentMethodId");
uuid_newtype!(ProductId, "ProductId");
uuid_newtype!(VariantId, "VariantId");
uuid_newtype!(WarehouseId, "WarehouseId");
uuid_newtype!(
    /// Identifier of a staff member acting on an order (audit only; no RBAC here).
    StaffId,
    "StaffId"
);
uuid_newtype!(DocumentId, "DocumentId");
