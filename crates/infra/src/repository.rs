//! Persistence boundary for orders, inventory, reservations and stock movements.
//!
//! Aggregates are stored as snapshots carrying their version. `save` takes an
//! [`ExpectedVersion`]; a writer that loaded an older snapshot loses with
//! [`StoreError::Conflict`] and is expected to reload and retry.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ordercore_core::{
    AggregateRoot, CustomerId, ErrorKind, ExpectedVersion, OrderId, OrderItemId, ProductId,
    VariantId,
};
use ordercore_inventory::{Inventory, InventoryKey, StockMovement};
use ordercore_sales::{Order, OrderStatus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Optimistic concurrency failure (stale aggregate version).
    #[error("version conflict on {id}: expected {expected:?}, found {actual}")]
    Conflict {
        id: String,
        expected: ExpectedVersion,
        actual: u64,
    },

    /// A reservation line no longer holds what the writer read.
    #[error("reservation for item {item_id} of order {order_id} changed concurrently")]
    ReservationChanged {
        order_id: OrderId,
        item_id: OrderItemId,
    },

    #[error("duplicate {0}")]
    Duplicate(String),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Conflict { .. }
            | StoreError::ReservationChanged { .. }
            | StoreError::Duplicate(_) => ErrorKind::Conflict,
            StoreError::Poisoned | StoreError::Backend(_) => ErrorKind::Infrastructure,
        }
    }
}

/// 1-based page of a listing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(page: usize, limit: usize) -> Self {
        Self {
            page: page.max(1),
            limit,
        }
    }

    fn slice<T>(&self, items: Vec<T>) -> Vec<T> {
        let skip = (self.page.max(1) - 1).saturating_mul(self.limit);
        items.into_iter().skip(skip).take(self.limit).collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, limit: 10 }
    }
}

pub trait OrderRepository: Send + Sync {
    fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError>;

    fn find_by_number(&self, order_number: &str) -> Result<Option<Order>, StoreError>;

    /// Newest first.
    fn find_by_customer(&self, customer_id: CustomerId, page: Page)
    -> Result<Vec<Order>, StoreError>;

    /// Newest first.
    fn find_by_status(&self, status: OrderStatus, page: Page) -> Result<Vec<Order>, StoreError>;

    /// Store `order` if the stored version still equals `expected`.
    /// Order numbers are unique across orders.
    fn save(&self, order: &Order, expected: ExpectedVersion) -> Result<(), StoreError>;
}

pub trait InventoryRepository: Send + Sync {
    fn find(&self, key: InventoryKey) -> Result<Option<Inventory>, StoreError>;

    /// Every warehouse record of a product/variant.
    fn find_by_item(
        &self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> Result<Vec<Inventory>, StoreError>;

    /// Records whose available quantity is at or below `threshold`.
    fn find_low_stock(&self, threshold: i64) -> Result<Vec<Inventory>, StoreError>;

    fn save(&self, inventory: &Inventory, expected: ExpectedVersion) -> Result<(), StoreError>;

    /// Returns whether a record was removed.
    fn delete(&self, key: InventoryKey, expected: ExpectedVersion) -> Result<bool, StoreError>;
}

/// Units of one inventory record held for one order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub order_id: OrderId,
    pub item_id: OrderItemId,
    pub key: InventoryKey,
    pub quantity: i64,
}

/// Correlates order lines with the inventory they hold. Keyed by `(order_id, item_id)`.
///
/// Writes are compare-and-set against the entry the caller read; a line that changed in
/// between fails with [`StoreError::ReservationChanged`].
pub trait ReservationLedger: Send + Sync {
    /// Store `reservation` if its line still holds `previous` (`None`: the line is empty).
    fn record(
        &self,
        reservation: Reservation,
        previous: Option<&Reservation>,
    ) -> Result<(), StoreError>;

    fn find(&self, order_id: OrderId, item_id: OrderItemId)
    -> Result<Option<Reservation>, StoreError>;

    fn for_order(&self, order_id: OrderId) -> Result<Vec<Reservation>, StoreError>;

    /// Remove the line if it still holds exactly `reservation`.
    fn remove(&self, reservation: &Reservation) -> Result<(), StoreError>;
}

/// Append-only audit trail of stock movements.
pub trait StockMovementLog: Send + Sync {
    fn append(&self, movement: StockMovement) -> Result<(), StoreError>;

    fn for_key(&self, key: InventoryKey) -> Result<Vec<StockMovement>, StoreError>;

    fn for_reference(&self, reference_id: &str) -> Result<Vec<StockMovement>, StoreError>;
}

/// Snapshot map with optimistic version checks.
#[derive(Debug)]
struct VersionedMap<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for VersionedMap<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> VersionedMap<K, V>
where
    K: Eq + Hash + Copy + core::fmt::Display,
    V: AggregateRoot + Clone,
{
    fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn filter(&self, mut pred: impl FnMut(&V) -> bool) -> Result<Vec<V>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.values().filter(|v| pred(v)).cloned().collect())
    }

    /// `check` runs under the write lock, before the version check.
    fn put(
        &self,
        key: K,
        value: &V,
        expected: ExpectedVersion,
        check: impl FnOnce(&HashMap<K, V>) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        check(&entries)?;

        let actual = entries.get(&key).map(AggregateRoot::version).unwrap_or(0);
        if !expected.matches(actual) {
            return Err(StoreError::Conflict {
                id: key.to_string(),
                expected,
                actual,
            });
        }

        entries.insert(key, value.clone());
        Ok(())
    }

    fn remove(&self, key: &K, expected: ExpectedVersion) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        let Some(current) = entries.get(key) else {
            return Ok(false);
        };
        let actual = current.version();
        if !expected.matches(actual) {
            return Err(StoreError::Conflict {
                id: key.to_string(),
                expected,
                actual,
            });
        }
        entries.remove(key);
        Ok(true)
    }
}

/// In-memory order store.
///
/// Intended for tests/dev. Listing scans every order.
#[derive(Debug, Default)]
pub struct InMemoryOrderRepository {
    orders: VersionedMap<OrderId, Order>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn newest_first(mut orders: Vec<Order>, page: Page) -> Vec<Order> {
        orders.sort_by(|a, b| {
            b.order_date()
                .cmp(&a.order_date())
                .then_with(|| b.id_typed().cmp(&a.id_typed()))
        });
        page.slice(orders)
    }
}

impl OrderRepository for InMemoryOrderRepository {
    fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.orders.get(&id)
    }

    fn find_by_number(&self, order_number: &str) -> Result<Option<Order>, StoreError> {
        Ok(self
            .orders
            .filter(|o| o.order_number() == order_number)?
            .into_iter()
            .next())
    }

    fn find_by_customer(
        &self,
        customer_id: CustomerId,
        page: Page,
    ) -> Result<Vec<Order>, StoreError> {
        let orders = self.orders.filter(|o| o.customer_id() == customer_id)?;
        Ok(Self::newest_first(orders, page))
    }

    fn find_by_status(&self, status: OrderStatus, page: Page) -> Result<Vec<Order>, StoreError> {
        let orders = self.orders.filter(|o| o.status() == status)?;
        Ok(Self::newest_first(orders, page))
    }

    fn save(&self, order: &Order, expected: ExpectedVersion) -> Result<(), StoreError> {
        let id = order.id_typed();
        self.orders.put(id, order, expected, |orders| {
            let taken = orders
                .values()
                .any(|o| o.id_typed() != id && o.order_number() == order.order_number());
            if taken {
                return Err(StoreError::Duplicate(format!(
                    "order number {}",
                    order.order_number()
                )));
            }
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
pub struct InMemoryInventoryRepository {
    records: VersionedMap<InventoryKey, Inventory>,
}

impl InMemoryInventoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InventoryRepository for InMemoryInventoryRepository {
    fn find(&self, key: InventoryKey) -> Result<Option<Inventory>, StoreError> {
        self.records.get(&key)
    }

    fn find_by_item(
        &self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> Result<Vec<Inventory>, StoreError> {
        let mut records = self
            .records
            .filter(|inv| inv.key().same_item(product_id, variant_id))?;
        records.sort_by_key(Inventory::key);
        Ok(records)
    }

    fn find_low_stock(&self, threshold: i64) -> Result<Vec<Inventory>, StoreError> {
        let mut records = self
            .records
            .filter(|inv| inv.available_quantity() <= threshold)?;
        records.sort_by_key(|inv| (inv.available_quantity(), inv.key()));
        Ok(records)
    }

    fn save(&self, inventory: &Inventory, expected: ExpectedVersion) -> Result<(), StoreError> {
        self.records
            .put(inventory.key(), inventory, expected, |_| Ok(()))
    }

    fn delete(&self, key: InventoryKey, expected: ExpectedVersion) -> Result<bool, StoreError> {
        self.records.remove(&key, expected)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryReservationLedger {
    reservations: RwLock<HashMap<(OrderId, OrderItemId), Reservation>>,
}

impl InMemoryReservationLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReservationLedger for InMemoryReservationLedger {
    fn record(
        &self,
        reservation: Reservation,
        previous: Option<&Reservation>,
    ) -> Result<(), StoreError> {
        let line = (reservation.order_id, reservation.item_id);
        let mut reservations = self.reservations.write().map_err(|_| StoreError::Poisoned)?;
        if reservations.get(&line) != previous {
            return Err(changed(line));
        }
        reservations.insert(line, reservation);
        Ok(())
    }

    fn find(
        &self,
        order_id: OrderId,
        item_id: OrderItemId,
    ) -> Result<Option<Reservation>, StoreError> {
        let reservations = self.reservations.read().map_err(|_| StoreError::Poisoned)?;
        Ok(reservations.get(&(order_id, item_id)).cloned())
    }

    fn for_order(&self, order_id: OrderId) -> Result<Vec<Reservation>, StoreError> {
        let reservations = self.reservations.read().map_err(|_| StoreError::Poisoned)?;
        let mut found: Vec<Reservation> = reservations
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.item_id);
        Ok(found)
    }

    fn remove(&self, reservation: &Reservation) -> Result<(), StoreError> {
        let line = (reservation.order_id, reservation.item_id);
        let mut reservations = self.reservations.write().map_err(|_| StoreError::Poisoned)?;
        if reservations.get(&line) != Some(reservation) {
            return Err(changed(line));
        }
        reservations.remove(&line);
        Ok(())
    }
}

fn changed((order_id, item_id): (OrderId, OrderItemId)) -> StoreError {
    StoreError::ReservationChanged { order_id, item_id }
}

#[derive(Debug, Default)]
pub struct InMemoryStockMovementLog {
    movements: RwLock<Vec<StockMovement>>,
}

impl InMemoryStockMovementLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StockMovementLog for InMemoryStockMovementLog {
    fn append(&self, movement: StockMovement) -> Result<(), StoreError> {
        let mut movements = self.movements.write().map_err(|_| StoreError::Poisoned)?;
        movements.push(movement);
        Ok(())
    }

    fn for_key(&self, key: InventoryKey) -> Result<Vec<StockMovement>, StoreError> {
        let movements = self.movements.read().map_err(|_| StoreError::Poisoned)?;
        Ok(movements.iter().filter(|m| m.key == key).cloned().collect())
    }

    fn for_reference(&self, reference_id: &str) -> Result<Vec<StockMovement>, StoreError> {
        let movements = self.movements.read().map_err(|_| StoreError::Poisoned)?;
        Ok(movements
            .iter()
            .filter(|m| m.reference_id.as_deref() == Some(reference_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ordercore_core::{AddressId, PaymentMethodId, WarehouseId};
    use ordercore_sales::PlaceOrder;

    fn placed(number: &str, customer_id: CustomerId) -> Order {
        Order::place(PlaceOrder {
            order_id: OrderId::new(),
            customer_id,
            order_number: number.to_string(),
            currency: "THB".to_string(),
            payment_method_id: PaymentMethodId::new(),
            shipping_address_id: AddressId::new(),
            billing_address_id: AddressId::new(),
            notes: String::new(),
            staff_id: None,
            occurred_at: Utc::now(),
        })
        .unwrap()
        .0
    }

    fn key() -> InventoryKey {
        InventoryKey::new(ProductId::new(), None, WarehouseId::new())
    }

    #[test]
    fn save_requires_expected_version() {
        let repo = InMemoryOrderRepository::new();
        let order = placed("ORD-1", CustomerId::new());

        repo.save(&order, ExpectedVersion::Exact(0)).unwrap();
        let err = repo.save(&order, ExpectedVersion::Exact(0)).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { actual: 1, .. }));
        assert_eq!(err.kind(), ErrorKind::Conflict);

        repo.save(&order, ExpectedVersion::Exact(1)).unwrap();
        assert_eq!(repo.find_by_id(order.id_typed()).unwrap(), Some(order));
    }

    #[test]
    fn order_numbers_are_unique() {
        let repo = InMemoryOrderRepository::new();
        repo.save(&placed("ORD-1", CustomerId::new()), ExpectedVersion::Exact(0))
            .unwrap();

        let err = repo
            .save(&placed("ORD-1", CustomerId::new()), ExpectedVersion::Exact(0))
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
        assert!(repo.find_by_number("ORD-1").unwrap().is_some());
        assert!(repo.find_by_number("ORD-2").unwrap().is_none());
    }

    #[test]
    fn customer_listing_is_paged() {
        let repo = InMemoryOrderRepository::new();
        let customer = CustomerId::new();
        for n in 0..5 {
            repo.save(&placed(&format!("ORD-{n}"), customer), ExpectedVersion::Exact(0))
                .unwrap();
        }
        repo.save(&placed("OTHER", CustomerId::new()), ExpectedVersion::Exact(0))
            .unwrap();

        assert_eq!(repo.find_by_customer(customer, Page::new(1, 2)).unwrap().len(), 2);
        assert_eq!(repo.find_by_customer(customer, Page::new(3, 2)).unwrap().len(), 1);
        assert!(repo.find_by_customer(customer, Page::new(4, 2)).unwrap().is_empty());
        assert_eq!(
            repo.find_by_status(OrderStatus::Pending, Page::new(1, 100))
                .unwrap()
                .len(),
            6
        );
    }

    #[test]
    fn inventory_delete_checks_version() {
        let repo = InMemoryInventoryRepository::new();
        let inv = Inventory::receive(key(), 5).unwrap();
        repo.save(&inv, ExpectedVersion::Exact(0)).unwrap();

        assert!(repo.delete(inv.key(), ExpectedVersion::Exact(0)).is_err());
        assert!(repo.delete(inv.key(), ExpectedVersion::Exact(1)).unwrap());
        assert!(!repo.delete(inv.key(), ExpectedVersion::Any).unwrap());
    }

    #[test]
    fn low_stock_uses_available_quantity() {
        let repo = InMemoryInventoryRepository::new();
        let mut held = Inventory::receive(key(), 10).unwrap();
        held.reserve_stock(8).unwrap();
        let plenty = Inventory::receive(key(), 50).unwrap();
        repo.save(&held, ExpectedVersion::Exact(0)).unwrap();
        repo.save(&plenty, ExpectedVersion::Exact(0)).unwrap();

        let low = repo.find_low_stock(5).unwrap();
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].key(), held.key());
    }

    #[test]
    fn ledger_writes_compare_against_what_was_read() {
        let ledger = InMemoryReservationLedger::new();
        let order_id = OrderId::new();
        let item_id = OrderItemId::new();
        let held = Reservation {
            order_id,
            item_id,
            key: key(),
            quantity: 2,
        };
        let resized = Reservation {
            quantity: 5,
            ..held.clone()
        };

        ledger.record(held.clone(), None).unwrap();
        assert!(matches!(
            ledger.record(held.clone(), None),
            Err(StoreError::ReservationChanged { .. })
        ));

        ledger.record(resized.clone(), Some(&held)).unwrap();
        let stale = ledger.record(held.clone(), Some(&held)).unwrap_err();
        assert_eq!(stale, StoreError::ReservationChanged { order_id, item_id });
        assert_eq!(stale.kind(), ErrorKind::Conflict);

        assert_eq!(ledger.for_order(order_id).unwrap().len(), 1);
        assert_eq!(ledger.find(order_id, item_id).unwrap(), Some(resized.clone()));

        assert!(ledger.remove(&held).is_err());
        ledger.remove(&resized).unwrap();
        assert!(ledger.for_order(order_id).unwrap().is_empty());
        assert!(ledger.remove(&resized).is_err());
    }

    #[test]
    fn movement_log_filters_by_reference() {
        let log = InMemoryStockMovementLog::new();
        let k = key();
        log.append(
            StockMovement::outbound(k, 2, ordercore_inventory::ReferenceType::Order)
                .unwrap()
                .with_reference("ORD-1"),
        )
        .unwrap();
        log.append(
            StockMovement::inbound(k, 9, ordercore_inventory::ReferenceType::PurchaseOrder)
                .unwrap(),
        )
        .unwrap();

        assert_eq!(log.for_key(k).unwrap().len(), 2);
        assert_eq!(log.for_reference("ORD-1").unwrap().len(), 1);
    }
}
