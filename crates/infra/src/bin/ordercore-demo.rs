//! Walks one order through its lifecycle against in-memory stores and logs each step.

use std::sync::Arc;

use anyhow::Context;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;

use ordercore_core::{AddressId, CustomerId, Money, PaymentMethodId, ProductId, WarehouseId};
use ordercore_events::{EventBus, EventEnvelope, InMemoryEventBus};
use ordercore_infra::external::{
    Address, CatalogProduct, Customer, InMemoryCatalog, InMemoryCustomerDirectory,
    InMemoryPaymentMethods, RecordingDocumentGenerator,
};
use ordercore_infra::{
    AddItemRequest, Collaborators, NewOrder, OrderService, OrderingConfig, PaymentDetails,
    ShipmentRequest, StockChange, Stores,
};
use ordercore_inventory::{InventoryKey, ReferenceType};
use ordercore_sales::{FeesType, PaymentMethod};

fn main() -> anyhow::Result<()> {
    ordercore_observability::init();

    let mut config = OrderingConfig::from_env().context("invalid ordering configuration")?;
    let warehouse = *config.default_warehouse.get_or_insert_with(WarehouseId::new);

    let customers = Arc::new(InMemoryCustomerDirectory::new());
    let customer_id = CustomerId::new();
    let address_id = AddressId::new();
    customers.insert_customer(Customer {
        id: customer_id,
        first_name: "Demo".into(),
        last_name: "Customer".into(),
        email: "demo@example.com".into(),
        phone: String::new(),
    })?;
    customers.insert_address(Address {
        id: address_id,
        customer_id,
        recipient_name: "Demo Customer".into(),
        address_line1: "1 Main Rd".into(),
        address_line2: String::new(),
        city: "Bangkok".into(),
        state: String::new(),
        postal_code: "10110".into(),
        country: "TH".into(),
        is_default: true,
    })?;

    let payment_methods = Arc::new(InMemoryPaymentMethods::new());
    let card = PaymentMethodId::new();
    payment_methods.insert(
        PaymentMethod::new(card, "Card").with_fee(FeesType::Percentage, Decimal::new(25, 1)),
    )?;

    let catalog = Arc::new(InMemoryCatalog::new());
    let product = ProductId::new();
    let price = Money::new(Decimal::new(19900, 2), config.currency.clone())
        .context("invalid demo currency")?;
    catalog.insert(CatalogProduct::new(product, "TEE", "T-Shirt", price))?;

    let bus = InMemoryEventBus::<EventEnvelope<JsonValue>>::new();
    let events = bus.subscribe();
    let service = OrderService::new(
        config,
        Stores::in_memory(),
        Collaborators {
            customers,
            catalog,
            payment_methods,
            documents: Arc::new(RecordingDocumentGenerator::new()),
        },
        bus,
    );

    let key = InventoryKey::new(product, None, warehouse);
    service.receive_stock(StockChange::new(key, 25, ReferenceType::PurchaseOrder))?;

    let order = service.create_order(NewOrder {
        customer_id,
        payment_method_id: card,
        shipping_address_id: address_id,
        billing_address_id: address_id,
        notes: String::new(),
        staff_id: None,
    })?;
    let order_id = order.id_typed();

    service.add_item(order_id, AddItemRequest::new(product, None, 3))?;
    let fee = service.quote_payment_fee(order_id)?;
    service.process_payment(order_id, PaymentDetails::default())?;
    service.create_shipment(
        order_id,
        ShipmentRequest {
            tracking_number: "DEMO-0001".into(),
            carrier: "Demo Post".into(),
            expected_delivery_date: None,
        },
    )?;
    let order = service.mark_delivered(order_id, None)?;
    let invoice = service.generate_invoice(order_id, None)?;

    tracing::info!(
        order_number = order.order_number(),
        status = %order.status(),
        total = %order.total_amount(),
        payment_fee = %fee,
        invoice = %invoice.document_number,
        events = events.drain().len(),
        "demo order completed"
    );
    Ok(())
}
