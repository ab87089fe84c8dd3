//! Order workflows spanning the order and inventory aggregates.
//!
//! Every workflow follows the same pipeline:
//!
//! ```text
//! load aggregate(s) → handle/execute (pure) → save with ExpectedVersion::Exact
//!   → (next step, undo pushed on the compensation stack) → … → publish events
//! ```
//!
//! A single-record step that loses the optimistic version check is re-loaded and
//! re-decided up to `max_conflict_retries` times. A workflow whose later step fails
//! runs the undo actions of the steps that already committed, so the order and its
//! stock end up as they were. Events are published only after the whole workflow
//! committed; publication failure is reported after the fact (at-least-once).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use ordercore_core::{
    Aggregate, AggregateRoot, AddressId, CustomerId, ErrorKind, ExpectedVersion, Money, OrderId,
    OrderItemId, PaymentMethodId, ProductId, StaffId, VariantId,
};
use ordercore_events::{Event, EventBus, EventEnvelope};
use ordercore_inventory::{
    Inventory, InventoryCommand, InventoryError, InventoryEvent, InventoryKey, QuantityChange,
    ReferenceType, StockMovement,
};
use ordercore_sales::{
    CancelOrder, NewOrderItem, Order, OrderCommand, OrderError, OrderEvent, OrderItem,
    OrderStatus, PaymentStatus, PlaceOrder, Transaction, UnknownStatus,
};

use crate::config::OrderingConfig;
use crate::external::{
    Catalog, CustomerDirectory, Document, DocumentGenerator, DocumentType, ExternalError,
    PaymentMethodDirectory,
};
use crate::repository::{
    InMemoryInventoryRepository, InMemoryOrderRepository, InMemoryReservationLedger,
    InMemoryStockMovementLog, InventoryRepository, OrderRepository, Page, Reservation,
    ReservationLedger, StockMovementLog, StoreError,
};
use crate::saga::Compensations;

pub const ORDER_AGGREGATE: &str = "sales.order";
pub const INVENTORY_AGGREGATE: &str = "inventory.stock";

#[derive(Debug, Error)]
pub enum OrderServiceError {
    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    #[error("order number {0} not found")]
    OrderNumberNotFound(String),

    #[error("customer {0} not found")]
    CustomerNotFound(CustomerId),

    #[error("address {address} not found for customer {customer_id}")]
    AddressNotFound {
        address: AddressId,
        customer_id: CustomerId,
    },

    #[error("payment method {0} not found")]
    PaymentMethodNotFound(PaymentMethodId),

    #[error("payment method {0} is inactive")]
    PaymentMethodInactive(PaymentMethodId),

    #[error("product {0} not found")]
    ProductNotFound(ProductId),

    #[error("product {0} is not active")]
    ProductInactive(ProductId),

    #[error("variant {variant_id} not found for product {product_id}")]
    VariantNotFound {
        product_id: ProductId,
        variant_id: VariantId,
    },

    #[error("inventory record {0} not found")]
    InventoryNotFound(InventoryKey),

    #[error(transparent)]
    UnknownStatus(#[from] UnknownStatus),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    External(#[from] ExternalError),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    /// The workflow committed but its events did not reach the bus.
    #[error("events committed but not published: {0}")]
    Publish(String),
}

impl OrderServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrderServiceError::OrderNotFound(_)
            | OrderServiceError::OrderNumberNotFound(_)
            | OrderServiceError::CustomerNotFound(_)
            | OrderServiceError::AddressNotFound { .. }
            | OrderServiceError::PaymentMethodNotFound(_)
            | OrderServiceError::ProductNotFound(_)
            | OrderServiceError::VariantNotFound { .. }
            | OrderServiceError::InventoryNotFound(_) => ErrorKind::NotFound,
            OrderServiceError::PaymentMethodInactive(_)
            | OrderServiceError::ProductInactive(_)
            | OrderServiceError::UnknownStatus(_) => ErrorKind::Validation,
            OrderServiceError::Order(e) => e.kind(),
            OrderServiceError::Inventory(e) => e.kind(),
            OrderServiceError::Store(e) => e.kind(),
            OrderServiceError::External(e) => e.kind(),
            OrderServiceError::Encode(_) | OrderServiceError::Publish(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Lost an optimistic check on a record or a reservation line; reloading and
    /// retrying can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrderServiceError::Store(
                StoreError::Conflict { .. } | StoreError::ReservationChanged { .. }
            )
        )
    }
}

/// Where orders, stock, reservations and movements live.
#[derive(Clone)]
pub struct Stores {
    pub orders: Arc<dyn OrderRepository>,
    pub inventory: Arc<dyn InventoryRepository>,
    pub reservations: Arc<dyn ReservationLedger>,
    pub movements: Arc<dyn StockMovementLog>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            orders: Arc::new(InMemoryOrderRepository::new()),
            inventory: Arc::new(InMemoryInventoryRepository::new()),
            reservations: Arc::new(InMemoryReservationLedger::new()),
            movements: Arc::new(InMemoryStockMovementLog::new()),
        }
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub customers: Arc<dyn CustomerDirectory>,
    pub catalog: Arc<dyn Catalog>,
    pub payment_methods: Arc<dyn PaymentMethodDirectory>,
    pub documents: Arc<dyn DocumentGenerator>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub customer_id: CustomerId,
    pub payment_method_id: PaymentMethodId,
    pub shipping_address_id: AddressId,
    pub billing_address_id: AddressId,
    pub notes: String,
    pub staff_id: Option<StaffId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddItemRequest {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity: i64,
    pub tax: Option<Money>,
    pub discount: Option<Money>,
}

impl AddItemRequest {
    pub fn new(product_id: ProductId, variant_id: Option<VariantId>, quantity: i64) -> Self {
        Self {
            product_id,
            variant_id,
            quantity,
            tax: None,
            discount: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentDetails {
    pub reference_number: String,
    pub gateway_response: String,
    pub gateway_transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipmentRequest {
    pub tracking_number: String,
    pub carrier: String,
    pub expected_delivery_date: Option<DateTime<Utc>>,
}

/// A manual stock change. `quantity` is signed for adjustments, positive for receipts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockChange {
    pub key: InventoryKey,
    pub quantity: i64,
    pub reference_type: ReferenceType,
    pub reference_id: Option<String>,
    pub notes: String,
    pub staff_id: Option<StaffId>,
}

impl StockChange {
    pub fn new(key: InventoryKey, quantity: i64, reference_type: ReferenceType) -> Self {
        Self {
            key,
            quantity,
            reference_type,
            reference_id: None,
            notes: String::new(),
            staff_id: None,
        }
    }
}

/// An aggregate after a successful versioned save, with the events that got it there.
struct Saved<A, E> {
    aggregate: A,
    events: Vec<E>,
    from_version: u64,
}

/// An order and the reservations held for its lines, read together.
///
/// While the order is pending or processing every line holds exactly its quantity;
/// a snapshot that disagrees was taken mid-workflow and is rejected as stale. Entries
/// for lines the order does not have yet belong to an `add_item` in flight and are left out.
struct Pinned {
    order: Order,
    held: Vec<Reservation>,
}

impl Pinned {
    fn held_for(&self, item_id: OrderItemId) -> Result<&Reservation, OrderServiceError> {
        self.held
            .iter()
            .find(|r| r.item_id == item_id)
            .ok_or_else(|| self.stale(item_id))
    }

    fn stale(&self, item_id: OrderItemId) -> OrderServiceError {
        StoreError::ReservationChanged {
            order_id: self.order.id_typed(),
            item_id,
        }
        .into()
    }
}

/// Envelopes waiting for the workflow to commit.
#[derive(Debug, Default)]
struct Outbox {
    envelopes: Vec<EventEnvelope<JsonValue>>,
}

impl Outbox {
    fn stage<A, E>(
        &mut self,
        aggregate_type: &'static str,
        saved: &Saved<A, E>,
    ) -> Result<(), OrderServiceError>
    where
        A: AggregateRoot,
        A::Id: core::fmt::Display,
        E: Event + Serialize,
    {
        let aggregate_id = saved.aggregate.id().to_string();
        for (offset, event) in saved.events.iter().enumerate() {
            let sequence_number = saved.from_version + offset as u64 + 1;
            self.envelopes.push(EventEnvelope::from_typed(
                aggregate_id.clone(),
                aggregate_type,
                sequence_number,
                event,
            )?);
        }
        Ok(())
    }
}

type Saga<'a> = Compensations<'a, OrderServiceError>;

/// Application service coordinating orders, stock and their collaborators.
pub struct OrderService<B> {
    config: OrderingConfig,
    orders: Arc<dyn OrderRepository>,
    inventory: Arc<dyn InventoryRepository>,
    reservations: Arc<dyn ReservationLedger>,
    movements: Arc<dyn StockMovementLog>,
    customers: Arc<dyn CustomerDirectory>,
    catalog: Arc<dyn Catalog>,
    payment_methods: Arc<dyn PaymentMethodDirectory>,
    documents: Arc<dyn DocumentGenerator>,
    bus: B,
}

impl<B> OrderService<B>
where
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(config: OrderingConfig, stores: Stores, collaborators: Collaborators, bus: B) -> Self {
        Self {
            config,
            orders: stores.orders,
            inventory: stores.inventory,
            reservations: stores.reservations,
            movements: stores.movements,
            customers: collaborators.customers,
            catalog: collaborators.catalog,
            payment_methods: collaborators.payment_methods,
            documents: collaborators.documents,
            bus,
        }
    }

    pub fn config(&self) -> &OrderingConfig {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    // ---- order workflows -------------------------------------------------------------

    #[instrument(skip_all, fields(customer_id = %request.customer_id))]
    pub fn create_order(&self, request: NewOrder) -> Result<Order, OrderServiceError> {
        let customer_id = request.customer_id;
        if self.customers.find_by_id(customer_id)?.is_none() {
            return Err(OrderServiceError::CustomerNotFound(customer_id));
        }

        let method = self
            .payment_methods
            .find_by_id(request.payment_method_id)?
            .ok_or(OrderServiceError::PaymentMethodNotFound(request.payment_method_id))?;
        if !method.is_active {
            return Err(OrderServiceError::PaymentMethodInactive(method.id));
        }

        let addresses = self.customers.find_addresses_by_customer_id(customer_id)?;
        for address in [request.shipping_address_id, request.billing_address_id] {
            if !addresses.iter().any(|a| a.id == address) {
                return Err(OrderServiceError::AddressNotFound {
                    address,
                    customer_id,
                });
            }
        }

        let now = Utc::now();
        let order_id = OrderId::new();
        let (order, placed) = Order::place(PlaceOrder {
            order_id,
            customer_id,
            order_number: self.order_number(order_id, now),
            currency: self.config.currency.clone(),
            payment_method_id: request.payment_method_id,
            shipping_address_id: request.shipping_address_id,
            billing_address_id: request.billing_address_id,
            notes: request.notes,
            staff_id: request.staff_id,
            occurred_at: now,
        })?;
        self.orders.save(&order, ExpectedVersion::Exact(0))?;

        let mut outbox = Outbox::default();
        outbox.stage(
            ORDER_AGGREGATE,
            &Saved {
                aggregate: order.clone(),
                events: vec![placed],
                from_version: 0,
            },
        )?;
        info!(order_id = %order_id, order_number = order.order_number(), "order created");
        self.publish(outbox)?;
        Ok(order)
    }

    /// Price the line from the catalog, hold the stock, then add the line.
    #[instrument(skip_all, fields(order_id = %order_id, product_id = %request.product_id))]
    pub fn add_item(
        &self,
        order_id: OrderId,
        request: AddItemRequest,
    ) -> Result<OrderItem, OrderServiceError> {
        let order = self.load_order(order_id)?;
        if !order.is_modifiable() {
            return Err(OrderError::NotPending(order.status()).into());
        }
        if request.quantity <= 0 {
            return Err(OrderError::InvalidQuantity(request.quantity).into());
        }

        let line = self.resolve_line(&request, Utc::now())?;
        let key = self.select_warehouse(request.product_id, request.variant_id, request.quantity)?;
        let item_id = line.id;
        let quantity = line.quantity;

        let saved = self.run_workflow("add_item", |saga, outbox| {
            self.reserve(saga, outbox, key, quantity)?;
            self.record_reservation(
                saga,
                Reservation {
                    order_id,
                    item_id,
                    key,
                    quantity,
                },
                None,
            )?;

            let saved = self.update_order(order_id, |order| order.add_item(line.clone()))?;
            outbox.stage(ORDER_AGGREGATE, &saved)?;
            Ok(saved)
        })?;

        info!(item_id = %item_id, warehouse = %key.warehouse_id, quantity, "item added");
        saved
            .aggregate
            .find_item(item_id)
            .cloned()
            .ok_or(OrderError::ItemNotFound(item_id).into())
    }

    /// Change a line's quantity, moving its reservation by the difference.
    #[instrument(skip_all, fields(order_id = %order_id, item_id = %item_id))]
    pub fn update_item(
        &self,
        order_id: OrderId,
        item_id: OrderItemId,
        quantity: i64,
    ) -> Result<OrderItem, OrderServiceError> {
        let (saved, from) = self.run_pinned("update_item", order_id, |pinned, saga, outbox| {
            ensure_line(&pinned.order, item_id)?;
            if quantity <= 0 {
                return Err(OrderError::InvalidQuantity(quantity).into());
            }
            let held = pinned.held_for(item_id)?;

            self.record_reservation(
                saga,
                Reservation {
                    quantity,
                    ..held.clone()
                },
                Some(held.clone()),
            )?;
            let delta = quantity - held.quantity;
            if delta > 0 {
                self.reserve(saga, outbox, held.key, delta)?;
            } else if delta < 0 {
                self.release(saga, outbox, held.key, -delta)?;
            }

            let saved = self.save_pinned(pinned, |order| order.update_item(item_id, quantity))?;
            outbox.stage(ORDER_AGGREGATE, &saved)?;
            Ok((saved, held.quantity))
        })?;

        info!(from, to = quantity, "item quantity changed");
        saved
            .aggregate
            .find_item(item_id)
            .cloned()
            .ok_or(OrderError::ItemNotFound(item_id).into())
    }

    #[instrument(skip_all, fields(order_id = %order_id, item_id = %item_id))]
    pub fn remove_item(
        &self,
        order_id: OrderId,
        item_id: OrderItemId,
    ) -> Result<Order, OrderServiceError> {
        let saved = self.run_pinned("remove_item", order_id, |pinned, saga, outbox| {
            ensure_line(&pinned.order, item_id)?;
            let held = pinned.held_for(item_id)?;

            self.drop_reservation(saga, held)?;
            self.release(saga, outbox, held.key, held.quantity)?;

            let saved = self.save_pinned(pinned, |order| order.remove_item(item_id))?;
            outbox.stage(ORDER_AGGREGATE, &saved)?;
            Ok(saved)
        })?;

        info!("item removed");
        Ok(saved.aggregate)
    }

    /// Record a paid transaction for the order total; a pending order moves to processing.
    #[instrument(skip_all, fields(order_id = %order_id))]
    pub fn process_payment(
        &self,
        order_id: OrderId,
        details: PaymentDetails,
    ) -> Result<Order, OrderServiceError> {
        let now = Utc::now();
        let saved = self.update_order(order_id, |order| {
            let transaction = Transaction::new(
                order.id_typed(),
                order.payment_method_id(),
                order.total_amount().clone(),
                PaymentStatus::Paid,
                now,
            )?
            .with_gateway(
                details.reference_number.clone(),
                details.gateway_transaction_id.clone(),
                details.gateway_response.clone(),
            );
            order.record_payment(transaction)
        })?;

        let mut outbox = Outbox::default();
        outbox.stage(ORDER_AGGREGATE, &saved)?;
        info!(
            amount = %saved.aggregate.total_amount(),
            status = %saved.aggregate.status(),
            "payment recorded"
        );
        self.publish(outbox)?;
        Ok(saved.aggregate)
    }

    /// Ship a processing order: every item's reservation is committed, one record at a time.
    #[instrument(skip_all, fields(order_id = %order_id))]
    pub fn create_shipment(
        &self,
        order_id: OrderId,
        request: ShipmentRequest,
    ) -> Result<Order, OrderServiceError> {
        let (saved, held) = self.run_pinned("create_shipment", order_id, |pinned, saga, outbox| {
            let status = pinned.order.status();
            if status != OrderStatus::Processing {
                return Err(OrderError::NotProcessing(status).into());
            }
            for reservation in &pinned.held {
                self.drop_reservation(saga, reservation)?;
                self.commit(saga, outbox, reservation.key, reservation.quantity)?;
            }

            let saved = self.save_pinned(pinned, |order| {
                order.add_shipment(
                    request.tracking_number.clone(),
                    request.carrier.clone(),
                    request.expected_delivery_date,
                )
            })?;
            outbox.stage(ORDER_AGGREGATE, &saved)?;
            Ok((saved, pinned.held.clone()))
        })?;

        let order = saved.aggregate;
        for reservation in &held {
            let movement = StockMovement::outbound(
                reservation.key,
                reservation.quantity,
                ReferenceType::Order,
            )
            .map(|m| m.with_reference(order.order_number()).with_notes("Order shipped"));
            self.log_movement(movement);
        }
        info!(items = held.len(), carrier = %request.carrier, "order shipped");
        Ok(order)
    }

    #[instrument(skip_all, fields(order_id = %order_id))]
    pub fn mark_delivered(
        &self,
        order_id: OrderId,
        staff_id: Option<StaffId>,
    ) -> Result<Order, OrderServiceError> {
        let saved = self.update_order(order_id, |order| order.mark_delivered(staff_id))?;

        let mut outbox = Outbox::default();
        outbox.stage(ORDER_AGGREGATE, &saved)?;
        info!("order delivered");
        self.publish(outbox)?;
        Ok(saved.aggregate)
    }

    /// Cancel the order and give back every unit it still holds.
    #[instrument(skip_all, fields(order_id = %order_id))]
    pub fn cancel_order(
        &self,
        order_id: OrderId,
        reason: &str,
        staff_id: Option<StaffId>,
    ) -> Result<Order, OrderServiceError> {
        let (saved, released) = self.run_pinned("cancel_order", order_id, |pinned, saga, outbox| {
            pinned.order.handle(&OrderCommand::Cancel(CancelOrder {
                reason: reason.to_string(),
                staff_id,
                occurred_at: Utc::now(),
            }))?;
            for reservation in &pinned.held {
                self.drop_reservation(saga, reservation)?;
                self.release(saga, outbox, reservation.key, reservation.quantity)?;
            }

            let saved = self.save_pinned(pinned, |order| order.cancel(reason, staff_id))?;
            outbox.stage(ORDER_AGGREGATE, &saved)?;
            Ok((saved, pinned.held.len()))
        })?;

        info!(released, reason, "order cancelled");
        Ok(saved.aggregate)
    }

    // ---- stock -----------------------------------------------------------------------

    /// Add received stock; the first receipt for a location creates its record.
    #[instrument(skip_all, fields(key = %change.key))]
    pub fn receive_stock(&self, change: StockChange) -> Result<Inventory, OrderServiceError> {
        let key = change.key;
        let saved = self.retrying("inventory", || {
            let mut inventory = self
                .inventory
                .find(key)?
                .unwrap_or_else(|| Inventory::empty(key));
            let from_version = inventory.version();
            let receipt = QuantityChange::now(key, change.quantity);
            let command = if inventory.is_created() {
                InventoryCommand::AddStock(receipt)
            } else {
                InventoryCommand::Receive(receipt)
            };
            let events = inventory.execute(&command)?;
            self.inventory
                .save(&inventory, ExpectedVersion::Exact(from_version))?;
            Ok(Saved {
                aggregate: inventory,
                events,
                from_version,
            })
        })?;

        let mut outbox = Outbox::default();
        outbox.stage(INVENTORY_AGGREGATE, &saved)?;
        self.log_movement(
            StockMovement::inbound(key, change.quantity, change.reference_type)
                .map(|m| with_details(m, &change)),
        );
        info!(quantity = change.quantity, on_hand = saved.aggregate.quantity(), "stock received");
        self.publish(outbox)?;
        Ok(saved.aggregate)
    }

    /// Manual correction: positive adds, negative removes (never below what is reserved).
    #[instrument(skip_all, fields(key = %change.key))]
    pub fn adjust_stock(&self, change: StockChange) -> Result<Inventory, OrderServiceError> {
        let (command, quantity): (fn(QuantityChange) -> InventoryCommand, i64) =
            match change.quantity {
                q if q > 0 => (InventoryCommand::AddStock, q),
                q if q < 0 => (
                    InventoryCommand::RemoveStock,
                    q.checked_neg().ok_or(InventoryError::InvalidQuantity(q))?,
                ),
                q => return Err(InventoryError::InvalidQuantity(q).into()),
            };
        let movement = if change.quantity > 0 {
            StockMovement::inbound(change.key, quantity, change.reference_type)
        } else {
            StockMovement::outbound(change.key, quantity, change.reference_type)
        };

        let saved = self.update_inventory(change.key, command, quantity)?;
        let mut outbox = Outbox::default();
        outbox.stage(INVENTORY_AGGREGATE, &saved)?;
        self.log_movement(movement.map(|m| with_details(m, &change)));
        info!(delta = change.quantity, on_hand = saved.aggregate.quantity(), "stock adjusted");
        self.publish(outbox)?;
        Ok(saved.aggregate)
    }

    /// Refuses while the record still holds stock.
    #[instrument(skip_all, fields(key = %key))]
    pub fn delete_inventory(&self, key: InventoryKey) -> Result<(), OrderServiceError> {
        self.retrying("inventory", || {
            let inventory = self
                .inventory
                .find(key)?
                .ok_or(OrderServiceError::InventoryNotFound(key))?;
            inventory.ensure_removable()?;
            self.inventory
                .delete(key, ExpectedVersion::Exact(inventory.version()))?;
            Ok(())
        })?;
        info!("inventory record deleted");
        Ok(())
    }

    pub fn inventory_for(
        &self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> Result<Vec<Inventory>, OrderServiceError> {
        Ok(self.inventory.find_by_item(product_id, variant_id)?)
    }

    pub fn low_stock(&self, threshold: i64) -> Result<Vec<Inventory>, OrderServiceError> {
        Ok(self.inventory.find_low_stock(threshold)?)
    }

    pub fn stock_movements(
        &self,
        key: InventoryKey,
    ) -> Result<Vec<StockMovement>, OrderServiceError> {
        Ok(self.movements.for_key(key)?)
    }

    pub fn reservations_for(&self, order_id: OrderId) -> Result<Vec<Reservation>, OrderServiceError> {
        Ok(self.reservations.for_order(order_id)?)
    }

    // ---- queries & documents ---------------------------------------------------------

    pub fn get_order(&self, order_id: OrderId) -> Result<Order, OrderServiceError> {
        self.load_order(order_id)
    }

    pub fn get_order_by_number(&self, order_number: &str) -> Result<Order, OrderServiceError> {
        self.orders
            .find_by_number(order_number)?
            .ok_or_else(|| OrderServiceError::OrderNumberNotFound(order_number.to_string()))
    }

    pub fn orders_for_customer(
        &self,
        customer_id: CustomerId,
        page: Page,
    ) -> Result<Vec<Order>, OrderServiceError> {
        Ok(self.orders.find_by_customer(customer_id, page)?)
    }

    /// `status` is parsed case-insensitively; unknown names are an error, not an empty list.
    pub fn orders_by_status(
        &self,
        status: &str,
        page: Page,
    ) -> Result<Vec<Order>, OrderServiceError> {
        let status: OrderStatus = status.parse()?;
        Ok(self.orders.find_by_status(status, page)?)
    }

    pub fn generate_invoice(
        &self,
        order_id: OrderId,
        staff_id: Option<StaffId>,
    ) -> Result<Document, OrderServiceError> {
        self.generate_document(order_id, DocumentType::Invoice, staff_id)
    }

    #[instrument(skip_all, fields(order_id = %order_id, document_type = ?document_type))]
    pub fn generate_document(
        &self,
        order_id: OrderId,
        document_type: DocumentType,
        staff_id: Option<StaffId>,
    ) -> Result<Document, OrderServiceError> {
        let order = self.load_order(order_id)?;
        let document = self.documents.generate(&order, document_type, staff_id)?;
        info!(document_number = %document.document_number, "document generated");
        Ok(document)
    }

    /// Surcharge the order's payment method adds to its current total.
    pub fn quote_payment_fee(&self, order_id: OrderId) -> Result<Money, OrderServiceError> {
        let order = self.load_order(order_id)?;
        let method = self
            .payment_methods
            .find_by_id(order.payment_method_id())?
            .ok_or(OrderServiceError::PaymentMethodNotFound(order.payment_method_id()))?;
        Ok(method
            .calculate_payment_fee(order.total_amount())
            .map_err(OrderError::from)?)
    }

    // ---- internals -------------------------------------------------------------------

    /// `{prefix}-{YYYYMMDD}-{last 12 hex digits of the order id}`.
    fn order_number(&self, order_id: OrderId, at: DateTime<Utc>) -> String {
        let hex = order_id.as_uuid().simple().to_string().to_uppercase();
        let suffix = &hex[hex.len() - 12..];
        format!(
            "{}-{}-{suffix}",
            self.config.order_number_prefix,
            at.format("%Y%m%d")
        )
    }

    fn load_order(&self, order_id: OrderId) -> Result<Order, OrderServiceError> {
        self.orders
            .find_by_id(order_id)?
            .ok_or(OrderServiceError::OrderNotFound(order_id))
    }

    fn resolve_line(
        &self,
        request: &AddItemRequest,
        now: DateTime<Utc>,
    ) -> Result<NewOrderItem, OrderServiceError> {
        let product = self
            .catalog
            .find_product(request.product_id)?
            .ok_or(OrderServiceError::ProductNotFound(request.product_id))?;
        if !product.is_active {
            return Err(OrderServiceError::ProductInactive(product.id));
        }

        let (sku, price) = match request.variant_id {
            Some(variant_id) => {
                let variant =
                    product
                        .variant(variant_id)
                        .ok_or(OrderServiceError::VariantNotFound {
                            product_id: product.id,
                            variant_id,
                        })?;
                (variant.sku.clone(), variant.current_price().clone())
            }
            None => (product.sku.clone(), product.current_price(now).clone()),
        };

        let mut line = NewOrderItem::new(
            product.id,
            request.variant_id,
            sku,
            product.name.clone(),
            request.quantity,
            price,
        );
        if let Some(tax) = &request.tax {
            line = line.with_tax(tax.clone());
        }
        if let Some(discount) = &request.discount {
            line = line.with_discount(discount.clone());
        }
        Ok(line)
    }

    /// The configured default warehouse if it can fulfil `quantity`, otherwise the
    /// location with the most available stock.
    fn select_warehouse(
        &self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        quantity: i64,
    ) -> Result<InventoryKey, OrderServiceError> {
        if let Some(warehouse_id) = self.config.default_warehouse {
            let key = InventoryKey::new(product_id, variant_id, warehouse_id);
            if let Some(inventory) = self.inventory.find(key)? {
                if inventory.can_fulfill(quantity) {
                    return Ok(key);
                }
            }
        }

        let best = self
            .inventory
            .find_by_item(product_id, variant_id)?
            .into_iter()
            .max_by(|a, b| {
                a.available_quantity()
                    .cmp(&b.available_quantity())
                    .then_with(|| b.key().cmp(&a.key()))
            });

        match best {
            Some(inventory) if inventory.can_fulfill(quantity) => Ok(inventory.key()),
            best => Err(InventoryError::InsufficientAvailableStock {
                requested: quantity,
                available: best.map_or(0, |inv| inv.available_quantity()),
            }
            .into()),
        }
    }

    fn retrying<T>(
        &self,
        record: &'static str,
        mut attempt: impl FnMut() -> Result<T, OrderServiceError>,
    ) -> Result<T, OrderServiceError> {
        let mut retries = 0;
        loop {
            match attempt() {
                Err(error) if error.is_retryable() && retries < self.config.max_conflict_retries => {
                    retries += 1;
                    debug!(record, retries, error = %error, "version conflict, reloading");
                }
                result => return result,
            }
        }
    }

    fn update_order(
        &self,
        order_id: OrderId,
        mut decide: impl FnMut(&mut Order) -> Result<Vec<OrderEvent>, OrderError>,
    ) -> Result<Saved<Order, OrderEvent>, OrderServiceError> {
        self.retrying("order", || {
            let mut order = self.load_order(order_id)?;
            let from_version = order.version();
            let events = decide(&mut order)?;
            if !events.is_empty() {
                self.orders
                    .save(&order, ExpectedVersion::Exact(from_version))?;
            }
            Ok(Saved {
                aggregate: order,
                events,
                from_version,
            })
        })
    }

    /// Reads the order, then its reservations; see [`Pinned`].
    fn pin(&self, order_id: OrderId) -> Result<Pinned, OrderServiceError> {
        let order = self.load_order(order_id)?;
        let mut held = self.reservations.for_order(order_id)?;
        held.retain(|r| order.find_item(r.item_id).is_some());

        let pinned = Pinned { order, held };
        if matches!(
            pinned.order.status(),
            OrderStatus::Pending | OrderStatus::Processing
        ) {
            for item in pinned.order.items() {
                if pinned.held_for(item.id)?.quantity != item.quantity {
                    return Err(pinned.stale(item.id));
                }
            }
        }
        Ok(pinned)
    }

    /// Runs `steps` against a fresh [`Pinned`] snapshot. The order is saved only at the
    /// snapshot's version, and reservation lines only if they still hold what was read,
    /// so a concurrent change compensates this attempt and starts over from a new snapshot.
    fn run_pinned<'a, T>(
        &'a self,
        workflow: &'static str,
        order_id: OrderId,
        mut steps: impl FnMut(&Pinned, &mut Saga<'a>, &mut Outbox) -> Result<T, OrderServiceError>,
    ) -> Result<T, OrderServiceError> {
        self.retrying(workflow, || {
            let pinned = self.pin(order_id)?;
            self.run_workflow(workflow, |saga, outbox| steps(&pinned, saga, outbox))
        })
    }

    fn save_pinned(
        &self,
        pinned: &Pinned,
        decide: impl FnOnce(&mut Order) -> Result<Vec<OrderEvent>, OrderError>,
    ) -> Result<Saved<Order, OrderEvent>, OrderServiceError> {
        let mut order = pinned.order.clone();
        let from_version = order.version();
        let events = decide(&mut order)?;
        if !events.is_empty() {
            self.orders
                .save(&order, ExpectedVersion::Exact(from_version))?;
        }
        Ok(Saved {
            aggregate: order,
            events,
            from_version,
        })
    }

    fn update_inventory(
        &self,
        key: InventoryKey,
        command: fn(QuantityChange) -> InventoryCommand,
        quantity: i64,
    ) -> Result<Saved<Inventory, InventoryEvent>, OrderServiceError> {
        self.retrying("inventory", || {
            let mut inventory = self
                .inventory
                .find(key)?
                .ok_or(OrderServiceError::InventoryNotFound(key))?;
            let from_version = inventory.version();
            let events = inventory.execute(&command(QuantityChange::now(key, quantity)))?;
            self.inventory
                .save(&inventory, ExpectedVersion::Exact(from_version))?;
            Ok(Saved {
                aggregate: inventory,
                events,
                from_version,
            })
        })
    }

    fn reserve<'a>(
        &'a self,
        saga: &mut Saga<'a>,
        outbox: &mut Outbox,
        key: InventoryKey,
        quantity: i64,
    ) -> Result<(), OrderServiceError> {
        let saved = self.update_inventory(key, InventoryCommand::ReserveStock, quantity)?;
        outbox.stage(INVENTORY_AGGREGATE, &saved)?;
        saga.push("reserve_stock", move || {
            self.update_inventory(key, InventoryCommand::ReleaseReservedStock, quantity)
                .map(drop)
        });
        Ok(())
    }

    fn release<'a>(
        &'a self,
        saga: &mut Saga<'a>,
        outbox: &mut Outbox,
        key: InventoryKey,
        quantity: i64,
    ) -> Result<(), OrderServiceError> {
        let saved = self.update_inventory(key, InventoryCommand::ReleaseReservedStock, quantity)?;
        outbox.stage(INVENTORY_AGGREGATE, &saved)?;
        saga.push("release_stock", move || {
            self.update_inventory(key, InventoryCommand::ReserveStock, quantity)
                .map(drop)
        });
        Ok(())
    }

    /// Undo puts the units back on hand and holds them again.
    fn commit<'a>(
        &'a self,
        saga: &mut Saga<'a>,
        outbox: &mut Outbox,
        key: InventoryKey,
        quantity: i64,
    ) -> Result<(), OrderServiceError> {
        let saved = self.update_inventory(key, InventoryCommand::CommitReservedStock, quantity)?;
        outbox.stage(INVENTORY_AGGREGATE, &saved)?;
        saga.push("commit_stock", move || {
            self.update_inventory(key, InventoryCommand::AddStock, quantity)?;
            self.update_inventory(key, InventoryCommand::ReserveStock, quantity)
                .map(drop)
        });
        Ok(())
    }

    /// Write the line over `previous` (`None`: a new line); undo puts `previous` back.
    fn record_reservation<'a>(
        &'a self,
        saga: &mut Saga<'a>,
        reservation: Reservation,
        previous: Option<Reservation>,
    ) -> Result<(), OrderServiceError> {
        self.reservations
            .record(reservation.clone(), previous.as_ref())?;
        saga.push("record_reservation", move || {
            match previous {
                Some(previous) => self.reservations.record(previous, Some(&reservation))?,
                None => self.reservations.remove(&reservation)?,
            }
            Ok(())
        });
        Ok(())
    }

    fn drop_reservation<'a>(
        &'a self,
        saga: &mut Saga<'a>,
        reservation: &Reservation,
    ) -> Result<(), OrderServiceError> {
        self.reservations.remove(reservation)?;
        let restored = reservation.clone();
        saga.push("drop_reservation", move || {
            self.reservations.record(restored, None)?;
            Ok(())
        });
        Ok(())
    }

    fn run_workflow<'a, T>(
        &'a self,
        workflow: &'static str,
        steps: impl FnOnce(&mut Saga<'a>, &mut Outbox) -> Result<T, OrderServiceError>,
    ) -> Result<T, OrderServiceError> {
        let mut saga = Compensations::new(workflow);
        let mut outbox = Outbox::default();
        match steps(&mut saga, &mut outbox) {
            Ok(value) => {
                saga.commit();
                self.publish(outbox)?;
                Ok(value)
            }
            Err(error) if saga.is_empty() => Err(error),
            Err(error) => {
                warn!(workflow, steps = saga.len(), error = %error, "workflow failed, compensating");
                let failed = saga.compensate();
                if !failed.is_empty() {
                    warn!(workflow, failed = ?failed, "workflow left partially compensated");
                }
                Err(error)
            }
        }
    }

    fn publish(&self, outbox: Outbox) -> Result<(), OrderServiceError> {
        for envelope in outbox.envelopes {
            let event_type = envelope.event_type().to_string();
            let aggregate_id = envelope.aggregate_id().to_string();
            if let Err(error) = self.bus.publish(envelope) {
                warn!(event_type, aggregate_id, error = ?error, "event publication failed");
                return Err(OrderServiceError::Publish(format!("{error:?}")));
            }
        }
        Ok(())
    }

    /// The movement log is an audit trail; a failed append never undoes the stock change.
    fn log_movement(&self, movement: Result<StockMovement, InventoryError>) {
        let appended = movement
            .map_err(OrderServiceError::from)
            .and_then(|m| self.movements.append(m).map_err(OrderServiceError::from));
        if let Err(error) = appended {
            warn!(error = %error, "stock movement not recorded");
        }
    }
}

/// Lines change only while the order is pending.
fn ensure_line(order: &Order, item_id: OrderItemId) -> Result<(), OrderError> {
    if !order.is_modifiable() {
        return Err(OrderError::NotPending(order.status()));
    }
    if order.find_item(item_id).is_none() {
        return Err(OrderError::ItemNotFound(item_id));
    }
    Ok(())
}

fn with_details(movement: StockMovement, change: &StockChange) -> StockMovement {
    let movement = movement
        .with_notes(change.notes.clone())
        .with_staff(change.staff_id);
    match &change.reference_id {
        Some(reference) => movement.with_reference(reference.clone()),
        None => movement,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{
        InMemoryCatalog, InMemoryCustomerDirectory, InMemoryPaymentMethods,
        RecordingDocumentGenerator,
    };
    use ordercore_core::WarehouseId;
    use ordercore_events::InMemoryEventBus;

    fn service(config: OrderingConfig) -> OrderService<InMemoryEventBus<EventEnvelope<JsonValue>>> {
        OrderService::new(
            config,
            Stores::in_memory(),
            Collaborators {
                customers: Arc::new(InMemoryCustomerDirectory::new()),
                catalog: Arc::new(InMemoryCatalog::new()),
                payment_methods: Arc::new(InMemoryPaymentMethods::new()),
                documents: Arc::new(RecordingDocumentGenerator::new()),
            },
            InMemoryEventBus::new(),
        )
    }

    fn stock(svc: &OrderService<InMemoryEventBus<EventEnvelope<JsonValue>>>, key: InventoryKey, q: i64) {
        svc.receive_stock(StockChange::new(key, q, ReferenceType::PurchaseOrder))
            .unwrap();
    }

    #[test]
    fn order_number_has_prefix_date_and_id_suffix() {
        let svc = service(OrderingConfig {
            order_number_prefix: "SO".into(),
            ..OrderingConfig::default()
        });
        let order_id = OrderId::new();
        let at = DateTime::parse_from_rfc3339("2024-03-05T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let number = svc.order_number(order_id, at);
        let hex = order_id.as_uuid().simple().to_string().to_uppercase();
        assert_eq!(number, format!("SO-20240305-{}", &hex[20..]));
    }

    #[test]
    fn prefers_default_warehouse_when_it_can_fulfil() {
        let product = ProductId::new();
        let main = WarehouseId::new();
        let other = WarehouseId::new();
        let svc = service(OrderingConfig {
            default_warehouse: Some(main),
            ..OrderingConfig::default()
        });
        stock(&svc, InventoryKey::new(product, None, main), 3);
        stock(&svc, InventoryKey::new(product, None, other), 50);

        assert_eq!(svc.select_warehouse(product, None, 3).unwrap().warehouse_id, main);
        assert_eq!(svc.select_warehouse(product, None, 4).unwrap().warehouse_id, other);
    }

    #[test]
    fn falls_back_to_best_stocked_location() {
        let product = ProductId::new();
        let small = WarehouseId::new();
        let large = WarehouseId::new();
        let svc = service(OrderingConfig::default());
        stock(&svc, InventoryKey::new(product, None, small), 2);
        stock(&svc, InventoryKey::new(product, None, large), 9);

        assert_eq!(svc.select_warehouse(product, None, 1).unwrap().warehouse_id, large);

        let err = svc.select_warehouse(product, None, 10).unwrap_err();
        assert!(matches!(
            err,
            OrderServiceError::Inventory(InventoryError::InsufficientAvailableStock {
                requested: 10,
                available: 9
            })
        ));
        assert!(svc.select_warehouse(ProductId::new(), None, 1).is_err());
    }

    #[test]
    fn adjust_stock_rejects_zero_and_guards_reservations() {
        let svc = service(OrderingConfig::default());
        let key = InventoryKey::new(ProductId::new(), None, WarehouseId::new());
        stock(&svc, key, 5);

        let zero = svc.adjust_stock(StockChange::new(key, 0, ReferenceType::Adjustment));
        assert!(matches!(
            zero.unwrap_err(),
            OrderServiceError::Inventory(InventoryError::InvalidQuantity(0))
        ));

        let inv = svc
            .adjust_stock(StockChange::new(key, -2, ReferenceType::Adjustment))
            .unwrap();
        assert_eq!(inv.quantity(), 3);
        assert_eq!(svc.stock_movements(key).unwrap().len(), 2);
    }

    #[test]
    fn adjust_stock_rejects_deltas_outside_the_counter_range() {
        let svc = service(OrderingConfig::default());
        let key = InventoryKey::new(ProductId::new(), None, WarehouseId::new());
        stock(&svc, key, 5);

        for delta in [i64::MIN, i64::MAX] {
            let err = svc
                .adjust_stock(StockChange::new(key, delta, ReferenceType::Adjustment))
                .unwrap_err();
            assert!(matches!(
                err,
                OrderServiceError::Inventory(InventoryError::InvalidQuantity(q)) if q == delta
            ));
        }
        assert_eq!(svc.inventory.find(key).unwrap().unwrap().quantity(), 5);
        assert_eq!(svc.stock_movements(key).unwrap().len(), 1);
    }

    #[test]
    fn conflicts_are_the_only_retryable_errors() {
        let conflict = OrderServiceError::Store(StoreError::Conflict {
            id: "x".into(),
            expected: ExpectedVersion::Exact(1),
            actual: 2,
        });
        assert!(conflict.is_retryable());
        assert_eq!(conflict.kind(), ErrorKind::Conflict);

        let changed = OrderServiceError::Store(StoreError::ReservationChanged {
            order_id: OrderId::new(),
            item_id: OrderItemId::new(),
        });
        assert!(changed.is_retryable());
        assert_eq!(changed.kind(), ErrorKind::Conflict);

        let missing = OrderServiceError::OrderNotFound(OrderId::new());
        assert!(!missing.is_retryable());
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }
}
