//! End-to-end order workflows against the in-memory stores.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value as JsonValue;

use ordercore_core::{
    AddressId, AggregateRoot, CustomerId, ErrorKind, ExpectedVersion, Money, OrderId,
    OrderItemId, PaymentMethodId, ProductId, VariantId, WarehouseId,
};
use ordercore_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};
use ordercore_infra::external::{
    Address, CatalogProduct, CatalogVariant, Customer, DocumentType, InMemoryCatalog,
    InMemoryCustomerDirectory, InMemoryPaymentMethods, RecordingDocumentGenerator,
};
use ordercore_infra::repository::{
    InMemoryOrderRepository, InMemoryReservationLedger, InventoryRepository, OrderRepository,
    Reservation, ReservationLedger,
};
use ordercore_infra::{
    AddItemRequest, Collaborators, NewOrder, OrderService, OrderServiceError, OrderingConfig,
    Page, PaymentDetails, ShipmentRequest, StockChange, StoreError, Stores,
};
use ordercore_inventory::{InventoryError, InventoryKey, MovementType, ReferenceType};
use ordercore_sales::{
    FeesType, Order, OrderError, OrderStatus, PaymentMethod, PaymentStatus, ShipmentStatus,
};

type Bus = InMemoryEventBus<EventEnvelope<JsonValue>>;

fn thb(amount: Decimal) -> Money {
    Money::new(amount, "THB").unwrap()
}

struct Fixture<B> {
    service: OrderService<B>,
    stores: Stores,
    documents: Arc<RecordingDocumentGenerator>,
    customer_id: CustomerId,
    address_id: AddressId,
    card: PaymentMethodId,
    retired: PaymentMethodId,
    tee: ProductId,
    large: VariantId,
    usd_mug: ProductId,
    warehouse: WarehouseId,
}

impl<B: EventBus<EventEnvelope<JsonValue>>> Fixture<B> {
    fn tee_key(&self) -> InventoryKey {
        InventoryKey::new(self.tee, None, self.warehouse)
    }

    fn large_key(&self) -> InventoryKey {
        InventoryKey::new(self.tee, Some(self.large), self.warehouse)
    }

    fn mug_key(&self) -> InventoryKey {
        InventoryKey::new(self.usd_mug, None, self.warehouse)
    }

    fn new_order(&self) -> NewOrder {
        NewOrder {
            customer_id: self.customer_id,
            payment_method_id: self.card,
            shipping_address_id: self.address_id,
            billing_address_id: self.address_id,
            notes: "leave at the door".to_string(),
            staff_id: None,
        }
    }

    fn place(&self) -> Order {
        self.service.create_order(self.new_order()).unwrap()
    }

    /// (on hand, reserved)
    fn stock(&self, key: InventoryKey) -> (i64, i64) {
        let inv = self.stores.inventory.find(key).unwrap().unwrap();
        (inv.quantity(), inv.reserved_quantity())
    }
}

fn fixture() -> Fixture<Bus> {
    fixture_with(OrderingConfig::default(), Stores::in_memory(), Bus::new())
}

fn fixture_with<B: EventBus<EventEnvelope<JsonValue>>>(
    config: OrderingConfig,
    stores: Stores,
    bus: B,
) -> Fixture<B> {
    let _ = ordercore_observability::init_for_tests();

    let customers = Arc::new(InMemoryCustomerDirectory::new());
    let customer_id = CustomerId::new();
    let address_id = AddressId::new();
    customers
        .insert_customer(Customer {
            id: customer_id,
            first_name: "Malee".into(),
            last_name: "Srisuk".into(),
            email: "malee@example.com".into(),
            phone: "0812345678".into(),
        })
        .unwrap();
    customers
        .insert_address(Address {
            id: address_id,
            customer_id,
            recipient_name: "Malee Srisuk".into(),
            address_line1: "99 Rama IV Rd".into(),
            address_line2: String::new(),
            city: "Bangkok".into(),
            state: String::new(),
            postal_code: "10500".into(),
            country: "TH".into(),
            is_default: true,
        })
        .unwrap();

    let payment_methods = Arc::new(InMemoryPaymentMethods::new());
    let card = PaymentMethodId::new();
    let retired = PaymentMethodId::new();
    payment_methods
        .insert(PaymentMethod::new(card, "Card").with_fee(FeesType::Percentage, dec!(2.5)))
        .unwrap();
    payment_methods
        .insert(PaymentMethod::new(retired, "Cheque").deactivated())
        .unwrap();

    let catalog = Arc::new(InMemoryCatalog::new());
    let tee = ProductId::new();
    let large = VariantId::new();
    let usd_mug = ProductId::new();
    catalog
        .insert(
            CatalogProduct::new(tee, "TEE", "T-Shirt", thb(dec!(199))).with_variant(
                CatalogVariant {
                    id: large,
                    sku: "TEE-L".into(),
                    name: "Large".into(),
                    price: thb(dec!(249)),
                    special_price: thb(dec!(0)),
                },
            ),
        )
        .unwrap();
    catalog
        .insert(CatalogProduct::new(
            usd_mug,
            "MUG",
            "Mug",
            Money::new(dec!(12), "USD").unwrap(),
        ))
        .unwrap();

    let documents = Arc::new(RecordingDocumentGenerator::new());
    let service = OrderService::new(
        config,
        stores.clone(),
        Collaborators {
            customers,
            catalog,
            payment_methods,
            documents: documents.clone(),
        },
        bus,
    );

    let fx = Fixture {
        service,
        stores,
        documents,
        customer_id,
        address_id,
        card,
        retired,
        tee,
        large,
        usd_mug,
        warehouse: WarehouseId::new(),
    };
    for (key, quantity) in [(fx.tee_key(), 10), (fx.large_key(), 5), (fx.mug_key(), 5)] {
        fx.service
            .receive_stock(StockChange::new(key, quantity, ReferenceType::PurchaseOrder))
            .unwrap();
    }
    fx
}

fn ship_request() -> ShipmentRequest {
    ShipmentRequest {
        tracking_number: "TH0001".into(),
        carrier: "Kerry".into(),
        expected_delivery_date: None,
    }
}

#[test]
fn full_lifecycle_reserves_commits_and_publishes() {
    let fx = fixture();
    let events = fx.service.bus().subscribe();

    let order = fx.place();
    assert_eq!(order.status(), OrderStatus::Pending);
    assert!(order.order_number().starts_with("ORD-"));

    fx.service
        .add_item(order.id_typed(), AddItemRequest::new(fx.tee, None, 2))
        .unwrap();
    let large = fx
        .service
        .add_item(order.id_typed(), AddItemRequest::new(fx.tee, Some(fx.large), 1))
        .unwrap();
    assert_eq!(large.sku, "TEE-L");
    assert_eq!(large.unit_price, thb(dec!(249)));
    assert_eq!(fx.stock(fx.tee_key()), (10, 2));
    assert_eq!(fx.stock(fx.large_key()), (5, 1));

    let paid = fx
        .service
        .process_payment(
            order.id_typed(),
            PaymentDetails {
                reference_number: "REF-1".into(),
                ..PaymentDetails::default()
            },
        )
        .unwrap();
    assert_eq!(paid.status(), OrderStatus::Processing);
    assert_eq!(paid.payment_status(), PaymentStatus::Paid);
    assert_eq!(paid.transactions()[0].amount, thb(dec!(647)));

    let shipped = fx
        .service
        .create_shipment(order.id_typed(), ship_request())
        .unwrap();
    assert_eq!(shipped.status(), OrderStatus::Shipped);
    assert_eq!(shipped.shipments()[0].status, ShipmentStatus::Shipped);
    assert_eq!(fx.stock(fx.tee_key()), (8, 0));
    assert_eq!(fx.stock(fx.large_key()), (4, 0));
    assert!(fx.service.reservations_for(order.id_typed()).unwrap().is_empty());

    let movements = fx.service.stock_movements(fx.tee_key()).unwrap();
    assert_eq!(movements.len(), 2);
    assert_eq!(movements[1].movement_type, MovementType::Out);
    assert_eq!(movements[1].reference_id.as_deref(), Some(order.order_number()));

    let delivered = fx.service.mark_delivered(order.id_typed(), None).unwrap();
    assert_eq!(delivered.status(), OrderStatus::Delivered);
    assert_eq!(delivered.shipments()[0].status, ShipmentStatus::Delivered);
    let history: Vec<_> = delivered.status_history().iter().map(|h| h.status).collect();
    assert_eq!(
        history,
        vec![
            OrderStatus::Pending,
            OrderStatus::Processing,
            OrderStatus::Shipped,
            OrderStatus::Delivered
        ]
    );

    let published = events.drain();
    assert_eq!(published.len(), 15);
    assert_eq!(published[0].event_type(), "sales.order.placed");
    let order_sequence: Vec<u64> = published
        .iter()
        .filter(|e| e.aggregate_type() == "sales.order")
        .map(|e| e.sequence_number())
        .collect();
    assert_eq!(order_sequence, (1..=11).collect::<Vec<_>>());
    assert_eq!(delivered.version(), 11);
}

#[test]
fn create_order_validates_collaborators() {
    let fx = fixture();

    let unknown = fx.service.create_order(NewOrder {
        customer_id: CustomerId::new(),
        ..fx.new_order()
    });
    assert!(matches!(unknown, Err(OrderServiceError::CustomerNotFound(_))));

    let retired = fx.service.create_order(NewOrder {
        payment_method_id: fx.retired,
        ..fx.new_order()
    });
    assert!(matches!(retired, Err(OrderServiceError::PaymentMethodInactive(_))));

    let foreign = fx.service.create_order(NewOrder {
        billing_address_id: AddressId::new(),
        ..fx.new_order()
    });
    let err = foreign.unwrap_err();
    assert!(matches!(err, OrderServiceError::AddressNotFound { .. }));
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert!(
        fx.service
            .orders_for_customer(fx.customer_id, Page::default())
            .unwrap()
            .is_empty()
    );
}

#[test]
fn insufficient_stock_touches_nothing() {
    let fx = fixture();
    let order = fx.place();

    let err = fx
        .service
        .add_item(order.id_typed(), AddItemRequest::new(fx.tee, None, 11))
        .unwrap_err();
    assert!(matches!(
        err,
        OrderServiceError::Inventory(InventoryError::InsufficientAvailableStock {
            requested: 11,
            available: 10
        })
    ));
    assert_eq!(fx.stock(fx.tee_key()), (10, 0));
    assert!(fx.service.get_order(order.id_typed()).unwrap().items().is_empty());
}

#[test]
fn failed_add_releases_the_reservation() {
    let fx = fixture();
    let order = fx.place();

    // Stock is reserved before the order rejects the USD price.
    let err = fx
        .service
        .add_item(order.id_typed(), AddItemRequest::new(fx.usd_mug, None, 2))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CurrencyMismatch);
    assert_eq!(fx.stock(fx.mug_key()), (5, 0));
    assert!(fx.service.reservations_for(order.id_typed()).unwrap().is_empty());
    assert_eq!(fx.service.get_order(order.id_typed()).unwrap().version(), 1);
}

#[test]
fn item_changes_move_reservations() {
    let fx = fixture();
    let order = fx.place();
    let item = fx
        .service
        .add_item(order.id_typed(), AddItemRequest::new(fx.tee, None, 2))
        .unwrap();

    let bigger = fx
        .service
        .update_item(order.id_typed(), item.id, 5)
        .unwrap();
    assert_eq!(bigger.total, thb(dec!(995)));
    assert_eq!(fx.stock(fx.tee_key()), (10, 5));

    fx.service.update_item(order.id_typed(), item.id, 1).unwrap();
    assert_eq!(fx.stock(fx.tee_key()), (10, 1));

    let too_many = fx.service.update_item(order.id_typed(), item.id, 20);
    assert!(too_many.is_err());
    assert_eq!(fx.stock(fx.tee_key()), (10, 1));
    let reservations = fx.service.reservations_for(order.id_typed()).unwrap();
    assert_eq!(reservations[0].quantity, 1);

    let emptied = fx.service.remove_item(order.id_typed(), item.id).unwrap();
    assert!(emptied.items().is_empty());
    assert!(emptied.total_amount().is_zero());
    assert_eq!(fx.stock(fx.tee_key()), (10, 0));
    assert!(fx.service.reservations_for(order.id_typed()).unwrap().is_empty());
}

#[test]
fn shipment_requires_processing() {
    let fx = fixture();
    let order = fx.place();
    fx.service
        .add_item(order.id_typed(), AddItemRequest::new(fx.tee, None, 2))
        .unwrap();

    let err = fx
        .service
        .create_shipment(order.id_typed(), ship_request())
        .unwrap_err();
    assert!(matches!(
        err,
        OrderServiceError::Order(OrderError::NotProcessing(OrderStatus::Pending))
    ));
    assert_eq!(fx.stock(fx.tee_key()), (10, 2));
}

#[test]
fn failed_shipment_undoes_every_commit() {
    let fx = fixture();
    let order = fx.place();
    fx.service
        .add_item(order.id_typed(), AddItemRequest::new(fx.tee, None, 2))
        .unwrap();
    fx.service
        .add_item(order.id_typed(), AddItemRequest::new(fx.tee, Some(fx.large), 1))
        .unwrap();
    fx.service
        .process_payment(order.id_typed(), PaymentDetails::default())
        .unwrap();

    // Both reservations commit, then the order rejects the blank tracking number.
    let err = fx
        .service
        .create_shipment(
            order.id_typed(),
            ShipmentRequest {
                tracking_number: " ".into(),
                ..ship_request()
            },
        )
        .unwrap_err();
    assert!(matches!(err, OrderServiceError::Order(OrderError::Validation(_))));

    assert_eq!(fx.stock(fx.tee_key()), (10, 2));
    assert_eq!(fx.stock(fx.large_key()), (5, 1));
    assert_eq!(fx.service.reservations_for(order.id_typed()).unwrap().len(), 2);
    let unchanged = fx.service.get_order(order.id_typed()).unwrap();
    assert_eq!(unchanged.status(), OrderStatus::Processing);
    assert!(unchanged.shipments().is_empty());
}

#[test]
fn cancel_releases_everything_held() {
    let fx = fixture();
    let order = fx.place();
    fx.service
        .add_item(order.id_typed(), AddItemRequest::new(fx.tee, None, 3))
        .unwrap();
    fx.service
        .add_item(order.id_typed(), AddItemRequest::new(fx.tee, Some(fx.large), 2))
        .unwrap();

    let cancelled = fx
        .service
        .cancel_order(order.id_typed(), "customer changed mind", None)
        .unwrap();
    assert_eq!(cancelled.status(), OrderStatus::Cancelled);
    assert_eq!(
        cancelled.status_history().last().unwrap().comment,
        "customer changed mind"
    );
    assert_eq!(fx.stock(fx.tee_key()), (10, 0));
    assert_eq!(fx.stock(fx.large_key()), (5, 0));

    let again = fx.service.cancel_order(order.id_typed(), "twice", None);
    assert!(matches!(
        again,
        Err(OrderServiceError::Order(OrderError::InvalidTransition { .. }))
    ));
}

#[test]
fn delivered_orders_cannot_be_cancelled() {
    let fx = fixture();
    let order = fx.place();
    fx.service
        .add_item(order.id_typed(), AddItemRequest::new(fx.tee, None, 1))
        .unwrap();
    fx.service
        .process_payment(order.id_typed(), PaymentDetails::default())
        .unwrap();
    fx.service
        .create_shipment(order.id_typed(), ship_request())
        .unwrap();
    fx.service.mark_delivered(order.id_typed(), None).unwrap();

    let err = fx
        .service
        .cancel_order(order.id_typed(), "too late", None)
        .unwrap_err();
    assert!(matches!(
        err,
        OrderServiceError::Order(OrderError::DeliveredCannotBeCancelled)
    ));
    assert_eq!(fx.stock(fx.tee_key()), (9, 0));
}

#[test]
fn paying_twice_is_rejected() {
    let fx = fixture();
    let order = fx.place();
    fx.service
        .process_payment(order.id_typed(), PaymentDetails::default())
        .unwrap();

    let err = fx
        .service
        .process_payment(order.id_typed(), PaymentDetails::default())
        .unwrap_err();
    assert!(matches!(err, OrderServiceError::Order(OrderError::AlreadyPaid)));
    assert_eq!(
        fx.service
            .get_order(order.id_typed())
            .unwrap()
            .transactions()
            .len(),
        1
    );
}

#[test]
fn queries_documents_and_fees() {
    let fx = fixture();
    let first = fx.place();
    let second = fx.place();
    fx.service
        .add_item(second.id_typed(), AddItemRequest::new(fx.tee, None, 1))
        .unwrap();
    fx.service
        .process_payment(second.id_typed(), PaymentDetails::default())
        .unwrap();

    let by_number = fx.service.get_order_by_number(first.order_number()).unwrap();
    assert_eq!(by_number.id_typed(), first.id_typed());
    assert!(matches!(
        fx.service.get_order_by_number("ORD-NOPE"),
        Err(OrderServiceError::OrderNumberNotFound(_))
    ));

    let processing = fx
        .service
        .orders_by_status(" Processing ", Page::default())
        .unwrap();
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].id_typed(), second.id_typed());
    let bogus = fx.service.orders_by_status("lost", Page::default()).unwrap_err();
    assert_eq!(bogus.kind(), ErrorKind::Validation);

    assert_eq!(
        fx.service
            .orders_for_customer(fx.customer_id, Page::new(1, 1))
            .unwrap()
            .len(),
        1
    );

    let fee = fx.service.quote_payment_fee(second.id_typed()).unwrap();
    assert_eq!(fee, thb(dec!(4.98)));

    let invoice = fx.service.generate_invoice(second.id_typed(), None).unwrap();
    assert_eq!(invoice.document_type, DocumentType::Invoice);
    assert_eq!(invoice.document_number, format!("INV-{}", second.order_number()));
    assert_eq!(fx.documents.documents().unwrap().len(), 1);
}

#[test]
fn stock_maintenance() {
    let fx = fixture();
    let fresh = InventoryKey::new(ProductId::new(), None, fx.warehouse);

    let received = fx
        .service
        .receive_stock(StockChange::new(fresh, 4, ReferenceType::PurchaseOrder))
        .unwrap();
    assert_eq!(received.quantity(), 4);
    assert_eq!(received.version(), 1);

    let low: Vec<_> = fx
        .service
        .low_stock(4)
        .unwrap()
        .into_iter()
        .map(|inv| inv.key())
        .collect();
    assert_eq!(low, vec![fresh]);

    let refused = fx.service.delete_inventory(fresh).unwrap_err();
    assert!(matches!(
        refused,
        OrderServiceError::Inventory(InventoryError::StillStocked { quantity: 4, .. })
    ));

    fx.service
        .adjust_stock(StockChange::new(fresh, -4, ReferenceType::Adjustment))
        .unwrap();
    fx.service.delete_inventory(fresh).unwrap();
    assert!(fx.stores.inventory.find(fresh).unwrap().is_none());
    assert!(matches!(
        fx.service.delete_inventory(fresh),
        Err(OrderServiceError::InventoryNotFound(_))
    ));
}

/// Loses the version check a set number of times before delegating.
#[derive(Default)]
struct ContendedOrders {
    inner: InMemoryOrderRepository,
    conflicts: AtomicU32,
}

impl ContendedOrders {
    fn lose_next(&self, times: u32) {
        self.conflicts.store(times, Ordering::SeqCst);
    }
}

impl OrderRepository for ContendedOrders {
    fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.inner.find_by_id(id)
    }

    fn find_by_number(&self, order_number: &str) -> Result<Option<Order>, StoreError> {
        self.inner.find_by_number(order_number)
    }

    fn find_by_customer(
        &self,
        customer_id: CustomerId,
        page: Page,
    ) -> Result<Vec<Order>, StoreError> {
        self.inner.find_by_customer(customer_id, page)
    }

    fn find_by_status(&self, status: OrderStatus, page: Page) -> Result<Vec<Order>, StoreError> {
        self.inner.find_by_status(status, page)
    }

    fn save(&self, order: &Order, expected: ExpectedVersion) -> Result<(), StoreError> {
        let lost = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(StoreError::Conflict {
                id: order.id_typed().to_string(),
                expected,
                actual: order.version(),
            });
        }
        self.inner.save(order, expected)
    }
}

fn contended_fixture() -> (Fixture<Bus>, Arc<ContendedOrders>) {
    let orders = Arc::new(ContendedOrders::default());
    let stores = Stores {
        orders: orders.clone(),
        ..Stores::in_memory()
    };
    let fx = fixture_with(
        OrderingConfig {
            max_conflict_retries: 3,
            ..OrderingConfig::default()
        },
        stores,
        Bus::new(),
    );
    (fx, orders)
}

#[test]
fn conflicts_are_retried_up_to_the_limit() {
    let (fx, orders) = contended_fixture();
    let order = fx.place();

    orders.lose_next(3);
    let paid = fx
        .service
        .process_payment(order.id_typed(), PaymentDetails::default())
        .unwrap();
    assert_eq!(paid.status(), OrderStatus::Processing);
    assert_eq!(paid.transactions().len(), 1);
    assert_eq!(orders.conflicts.load(Ordering::SeqCst), 0);
}

#[test]
fn exhausted_retries_compensate_the_workflow() {
    let (fx, orders) = contended_fixture();
    let order = fx.place();
    fx.service
        .add_item(order.id_typed(), AddItemRequest::new(fx.tee, None, 4))
        .unwrap();

    orders.lose_next(4);
    let err = fx
        .service
        .cancel_order(order.id_typed(), "contended", None)
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(fx.stock(fx.tee_key()), (10, 4));
    assert_eq!(fx.service.reservations_for(order.id_typed()).unwrap().len(), 1);
    assert_eq!(
        fx.service.get_order(order.id_typed()).unwrap().status(),
        OrderStatus::Pending
    );

    orders.lose_next(0);
    fx.service
        .cancel_order(order.id_typed(), "contended", None)
        .unwrap();
    assert_eq!(fx.stock(fx.tee_key()), (10, 0));
}

/// Ledger whose next `for_order` read parks until the test releases it.
#[derive(Default)]
struct PausingLedger {
    inner: InMemoryReservationLedger,
    gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
}

impl PausingLedger {
    /// Returns `(parked, release)`.
    fn pause_next_read(&self) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (parked_tx, parked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.gate.lock().unwrap() = Some((parked_tx, release_rx));
        (parked_rx, release_tx)
    }
}

impl ReservationLedger for PausingLedger {
    fn record(
        &self,
        reservation: Reservation,
        previous: Option<&Reservation>,
    ) -> Result<(), StoreError> {
        self.inner.record(reservation, previous)
    }

    fn find(
        &self,
        order_id: OrderId,
        item_id: OrderItemId,
    ) -> Result<Option<Reservation>, StoreError> {
        self.inner.find(order_id, item_id)
    }

    fn for_order(&self, order_id: OrderId) -> Result<Vec<Reservation>, StoreError> {
        let held = self.inner.for_order(order_id)?;
        let gate = self.gate.lock().unwrap().take();
        if let Some((parked, release)) = gate {
            parked.send(()).unwrap();
            release.recv().unwrap();
        }
        Ok(held)
    }

    fn remove(&self, reservation: &Reservation) -> Result<(), StoreError> {
        self.inner.remove(reservation)
    }
}

fn pausing_fixture() -> (Fixture<Bus>, Arc<PausingLedger>) {
    let ledger = Arc::new(PausingLedger::default());
    let stores = Stores {
        reservations: ledger.clone(),
        ..Stores::in_memory()
    };
    let fx = fixture_with(OrderingConfig::default(), stores, Bus::new());
    (fx, ledger)
}

#[test]
fn cancel_releases_a_line_added_while_it_was_reading() {
    let (fx, ledger) = pausing_fixture();
    let order_id = fx.place().id_typed();
    let service = &fx.service;

    let (parked, release) = ledger.pause_next_read();
    let cancelled = std::thread::scope(|scope| {
        let cancel = scope.spawn(|| service.cancel_order(order_id, "changed mind", None));
        parked.recv().unwrap();
        service
            .add_item(order_id, AddItemRequest::new(fx.tee, None, 3))
            .unwrap();
        release.send(()).unwrap();
        cancel.join().unwrap()
    })
    .unwrap();

    assert_eq!(cancelled.status(), OrderStatus::Cancelled);
    assert_eq!(cancelled.items().len(), 1);
    assert_eq!(fx.stock(fx.tee_key()), (10, 0));
    assert!(fx.service.reservations_for(order_id).unwrap().is_empty());
}

#[test]
fn concurrent_resizes_keep_stock_in_step_with_the_line() {
    let (fx, ledger) = pausing_fixture();
    let order_id = fx.place().id_typed();
    let item = fx
        .service
        .add_item(order_id, AddItemRequest::new(fx.tee, None, 3))
        .unwrap();
    let service = &fx.service;

    let (parked, release) = ledger.pause_next_read();
    let shrunk = std::thread::scope(|scope| {
        let shrink = scope.spawn(|| service.update_item(order_id, item.id, 2));
        parked.recv().unwrap();
        service.update_item(order_id, item.id, 5).unwrap();
        release.send(()).unwrap();
        shrink.join().unwrap()
    })
    .unwrap();

    assert_eq!(shrunk.quantity, 2);
    let order = fx.service.get_order(order_id).unwrap();
    assert_eq!(order.items()[0].quantity, 2);
    assert_eq!(fx.stock(fx.tee_key()), (10, 2));
    let held = fx.service.reservations_for(order_id).unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].quantity, 2);
}

struct ClosedBus;

impl EventBus<EventEnvelope<JsonValue>> for ClosedBus {
    type Error = &'static str;

    fn publish(&self, _message: EventEnvelope<JsonValue>) -> Result<(), Self::Error> {
        Err("bus closed")
    }

    fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>> {
        let (_tx, rx) = mpsc::channel();
        Subscription::new(rx)
    }
}

#[test]
fn publish_failure_is_reported_after_commit() {
    let stores = Stores::in_memory();
    let orders = stores.orders.clone();
    let customers = Arc::new(InMemoryCustomerDirectory::new());
    let customer_id = CustomerId::new();
    let address_id = AddressId::new();
    customers
        .insert_customer(Customer {
            id: customer_id,
            first_name: "Anan".into(),
            last_name: "K".into(),
            email: "anan@example.com".into(),
            phone: String::new(),
        })
        .unwrap();
    customers
        .insert_address(Address {
            id: address_id,
            customer_id,
            recipient_name: "Anan".into(),
            address_line1: "1 Silom".into(),
            address_line2: String::new(),
            city: "Bangkok".into(),
            state: String::new(),
            postal_code: "10500".into(),
            country: "TH".into(),
            is_default: true,
        })
        .unwrap();
    let payment_methods = Arc::new(InMemoryPaymentMethods::new());
    let card = PaymentMethodId::new();
    payment_methods
        .insert(PaymentMethod::new(card, "Card"))
        .unwrap();

    let service = OrderService::new(
        OrderingConfig::default(),
        stores,
        Collaborators {
            customers,
            catalog: Arc::new(InMemoryCatalog::new()),
            payment_methods,
            documents: Arc::new(RecordingDocumentGenerator::new()),
        },
        ClosedBus,
    );

    let err = service
        .create_order(NewOrder {
            customer_id,
            payment_method_id: card,
            shipping_address_id: address_id,
            billing_address_id: address_id,
            notes: String::new(),
            staff_id: None,
        })
        .unwrap_err();
    assert!(matches!(err, OrderServiceError::Publish(_)));
    assert_eq!(err.kind(), ErrorKind::Infrastructure);
    assert_eq!(
        orders
            .find_by_customer(customer_id, Page::default())
            .unwrap()
            .len(),
        1
    );
}

#[derive(Debug, Clone)]
enum LineOp {
    Add(i64),
    Resize(usize, i64),
    Remove(usize),
}

fn line_op() -> impl Strategy<Value = LineOp> {
    prop_oneof![
        (1i64..4).prop_map(LineOp::Add),
        (0usize..4, 1i64..6).prop_map(|(i, q)| LineOp::Resize(i, q)),
        (0usize..4).prop_map(LineOp::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 32, ..ProptestConfig::default() })]

    /// Whatever succeeds or fails, reserved stock equals the ledger equals the order lines.
    #[test]
    fn reservations_track_order_lines(ops in proptest::collection::vec(line_op(), 1..12)) {
        let fx = fixture();
        let order_id = fx.place().id_typed();

        for op in ops {
            let items = fx.service.get_order(order_id).unwrap().items().to_vec();
            let _ = match op {
                LineOp::Add(q) => fx
                    .service
                    .add_item(order_id, AddItemRequest::new(fx.tee, None, q))
                    .map(drop),
                LineOp::Resize(i, q) => match items.get(i) {
                    Some(item) => fx.service.update_item(order_id, item.id, q).map(drop),
                    None => Ok(()),
                },
                LineOp::Remove(i) => match items.get(i) {
                    Some(item) => fx.service.remove_item(order_id, item.id).map(drop),
                    None => Ok(()),
                },
            };

            let order = fx.service.get_order(order_id).unwrap();
            let ordered: i64 = order.items().iter().map(|i| i.quantity).sum();
            let ledger: i64 = fx
                .service
                .reservations_for(order_id)
                .unwrap()
                .iter()
                .map(|r| r.quantity)
                .sum();
            let (on_hand, reserved) = fx.stock(fx.tee_key());

            prop_assert_eq!(on_hand, 10);
            prop_assert_eq!(reserved, ordered);
            prop_assert_eq!(ledger, ordered);
        }
    }
}
