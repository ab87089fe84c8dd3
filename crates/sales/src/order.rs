use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ordercore_core::entity::{find_by_id, position_by_id};
use ordercore_core::{
    Aggregate, AggregateRoot, AddressId, CustomerId, Money, MoneyError, OrderId, OrderItemId,
    PaymentMethodId, ShipmentId, StaffId,
};
use ordercore_events::Event;

use crate::error::OrderError;
use crate::item::{NewOrderItem, OrderItem, OrderStatusHistory, OrderTotals};
use crate::payment::Transaction;
use crate::shipment::{Shipment, ShipmentStatus};
use crate::status::{OrderStatus, PaymentStatus};

/// Aggregate root: Order.
///
/// Owns its items, status history, shipments and transactions. Every rule is checked in
/// `handle`; events carry the already-computed totals so `apply` cannot fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    customer_id: CustomerId,
    order_number: String,
    order_date: DateTime<Utc>,
    status: OrderStatus,
    payment_status: PaymentStatus,
    totals: OrderTotals,
    payment_method_id: PaymentMethodId,
    shipping_address_id: AddressId,
    billing_address_id: AddressId,
    notes: String,
    items: Vec<OrderItem>,
    status_history: Vec<OrderStatusHistory>,
    shipments: Vec<Shipment>,
    transactions: Vec<Transaction>,
    version: u64,
}

impl Order {
    /// Place a new order in `pending` with zero totals in `cmd.currency`.
    pub fn place(cmd: PlaceOrder) -> Result<(Self, OrderEvent), OrderError> {
        if cmd.order_number.trim().is_empty() {
            return Err(OrderError::validation("order number is required"));
        }
        let totals = OrderTotals::zero(&cmd.currency)?;

        let event = OrderPlaced {
            order_id: cmd.order_id,
            customer_id: cmd.customer_id,
            order_number: cmd.order_number,
            payment_method_id: cmd.payment_method_id,
            shipping_address_id: cmd.shipping_address_id,
            billing_address_id: cmd.billing_address_id,
            notes: cmd.notes,
            totals,
            entry: OrderStatusHistory {
                status: OrderStatus::Pending,
                comment: "Order created".to_string(),
                staff_id: cmd.staff_id,
                created_at: cmd.occurred_at,
            },
        };

        let mut order = Self::from_placed(&event);
        let event = OrderEvent::OrderPlaced(event);
        order.apply(&event);
        Ok((order, event))
    }

    /// Rebuild an order from its event history. The first event must be `OrderPlaced`.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a OrderEvent>) -> Option<Self> {
        let mut events = events.into_iter();
        let first = events.next()?;
        let OrderEvent::OrderPlaced(placed) = first else {
            return None;
        };
        let mut order = Self::from_placed(placed);
        order.apply(first);
        for event in events {
            order.apply(event);
        }
        Some(order)
    }

    fn from_placed(e: &OrderPlaced) -> Self {
        Self {
            id: e.order_id,
            customer_id: e.customer_id,
            order_number: e.order_number.clone(),
            order_date: e.entry.created_at,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            totals: e.totals.clone(),
            payment_method_id: e.payment_method_id,
            shipping_address_id: e.shipping_address_id,
            billing_address_id: e.billing_address_id,
            notes: e.notes.clone(),
            items: Vec::new(),
            status_history: vec![e.entry.clone()],
            shipments: Vec::new(),
            transactions: Vec::new(),
            version: 0,
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn order_number(&self) -> &str {
        &self.order_number
    }

    pub fn order_date(&self) -> DateTime<Utc> {
        self.order_date
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn payment_status(&self) -> PaymentStatus {
        self.payment_status
    }

    pub fn currency(&self) -> &str {
        self.totals.total_amount.currency()
    }

    pub fn totals(&self) -> &OrderTotals {
        &self.totals
    }

    pub fn subtotal(&self) -> &Money {
        &self.totals.subtotal
    }

    pub fn shipping_fee(&self) -> &Money {
        &self.totals.shipping_fee
    }

    pub fn tax_amount(&self) -> &Money {
        &self.totals.tax_amount
    }

    pub fn discount_amount(&self) -> &Money {
        &self.totals.discount_amount
    }

    pub fn total_amount(&self) -> &Money {
        &self.totals.total_amount
    }

    pub fn payment_method_id(&self) -> PaymentMethodId {
        self.payment_method_id
    }

    pub fn shipping_address_id(&self) -> AddressId {
        self.shipping_address_id
    }

    pub fn billing_address_id(&self) -> AddressId {
        self.billing_address_id
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn find_item(&self, item_id: OrderItemId) -> Option<&OrderItem> {
        find_by_id(&self.items, &item_id)
    }

    pub fn status_history(&self) -> &[OrderStatusHistory] {
        &self.status_history
    }

    pub fn shipments(&self) -> &[Shipment] {
        &self.shipments
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn is_modifiable(&self) -> bool {
        self.status == OrderStatus::Pending
    }
}

// Convenience entry points stamped with the current time.
impl Order {
    pub fn add_item(&mut self, item: NewOrderItem) -> Result<Vec<OrderEvent>, OrderError> {
        self.execute(&OrderCommand::AddItem(AddItem {
            item,
            occurred_at: Utc::now(),
        }))
    }

    pub fn update_item(
        &mut self,
        item_id: OrderItemId,
        quantity: i64,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.execute(&OrderCommand::UpdateItem(UpdateItem {
            item_id,
            quantity,
            occurred_at: Utc::now(),
        }))
    }

    pub fn remove_item(&mut self, item_id: OrderItemId) -> Result<Vec<OrderEvent>, OrderError> {
        self.execute(&OrderCommand::RemoveItem(RemoveItem {
            item_id,
            occurred_at: Utc::now(),
        }))
    }

    pub fn set_shipping_fee(&mut self, amount: Money) -> Result<Vec<OrderEvent>, OrderError> {
        self.set_charge(Charge::ShippingFee, amount)
    }

    pub fn set_discount(&mut self, amount: Money) -> Result<Vec<OrderEvent>, OrderError> {
        self.set_charge(Charge::Discount, amount)
    }

    pub fn set_tax_amount(&mut self, amount: Money) -> Result<Vec<OrderEvent>, OrderError> {
        self.set_charge(Charge::Tax, amount)
    }

    fn set_charge(&mut self, charge: Charge, amount: Money) -> Result<Vec<OrderEvent>, OrderError> {
        self.execute(&OrderCommand::SetCharge(SetCharge {
            charge,
            amount,
            occurred_at: Utc::now(),
        }))
    }

    pub fn transition_to(
        &mut self,
        to: OrderStatus,
        comment: impl Into<String>,
        staff_id: Option<StaffId>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.execute(&OrderCommand::ChangeStatus(ChangeStatus {
            to,
            comment: comment.into(),
            staff_id,
            occurred_at: Utc::now(),
        }))
    }

    pub fn cancel(
        &mut self,
        reason: impl Into<String>,
        staff_id: Option<StaffId>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.execute(&OrderCommand::Cancel(CancelOrder {
            reason: reason.into(),
            staff_id,
            occurred_at: Utc::now(),
        }))
    }

    pub fn update_payment_status(
        &mut self,
        status: PaymentStatus,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.execute(&OrderCommand::UpdatePaymentStatus(UpdatePaymentStatus {
            status,
            occurred_at: Utc::now(),
        }))
    }

    pub fn record_payment(
        &mut self,
        transaction: Transaction,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.execute(&OrderCommand::RecordPayment(RecordPayment { transaction }))
    }

    pub fn add_shipment(
        &mut self,
        tracking_number: impl Into<String>,
        carrier: impl Into<String>,
        expected_delivery_date: Option<DateTime<Utc>>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.execute(&OrderCommand::AddShipment(AddShipment {
            shipment_id: ShipmentId::new(),
            tracking_number: tracking_number.into(),
            carrier: carrier.into(),
            expected_delivery_date,
            occurred_at: Utc::now(),
        }))
    }

    pub fn mark_delivered(
        &mut self,
        staff_id: Option<StaffId>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.execute(&OrderCommand::MarkDelivered(MarkDelivered {
            staff_id,
            occurred_at: Utc::now(),
        }))
    }

    pub fn fail_shipment(&mut self, shipment_id: ShipmentId) -> Result<Vec<OrderEvent>, OrderError> {
        self.execute(&OrderCommand::FailShipment(FailShipment {
            shipment_id,
            occurred_at: Utc::now(),
        }))
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Input for [`Order::place`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub order_number: String,
    pub currency: String,
    pub payment_method_id: PaymentMethodId,
    pub shipping_address_id: AddressId,
    pub billing_address_id: AddressId,
    pub notes: String,
    pub staff_id: Option<StaffId>,
    pub occurred_at: DateTime<Utc>,
}

/// Which order-level charge a [`SetCharge`] targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Charge {
    ShippingFee,
    Discount,
    Tax,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddItem {
    pub item: NewOrderItem,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateItem {
    pub item_id: OrderItemId,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveItem {
    pub item_id: OrderItemId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetCharge {
    pub charge: Charge,
    pub amount: Money,
    pub occurred_at: DateTime<Utc>,
}

/// The guarded status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStatus {
    pub to: OrderStatus,
    pub comment: String,
    pub staff_id: Option<StaffId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub reason: String,
    pub staff_id: Option<StaffId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePaymentStatus {
    pub status: PaymentStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Record a payment attempt; its status becomes the order's payment status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPayment {
    pub transaction: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddShipment {
    pub shipment_id: ShipmentId,
    pub tracking_number: String,
    pub carrier: String,
    pub expected_delivery_date: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkDelivered {
    pub staff_id: Option<StaffId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailShipment {
    pub shipment_id: ShipmentId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    AddItem(AddItem),
    UpdateItem(UpdateItem),
    RemoveItem(RemoveItem),
    SetCharge(SetCharge),
    ChangeStatus(ChangeStatus),
    Cancel(CancelOrder),
    UpdatePaymentStatus(UpdatePaymentStatus),
    RecordPayment(RecordPayment),
    AddShipment(AddShipment),
    MarkDelivered(MarkDelivered),
    FailShipment(FailShipment),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub order_number: String,
    pub payment_method_id: PaymentMethodId,
    pub shipping_address_id: AddressId,
    pub billing_address_id: AddressId,
    pub notes: String,
    pub totals: OrderTotals,
    pub entry: OrderStatusHistory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAdded {
    pub order_id: OrderId,
    pub item: OrderItem,
    pub totals: OrderTotals,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemUpdated {
    pub order_id: OrderId,
    pub item: OrderItem,
    pub totals: OrderTotals,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRemoved {
    pub order_id: OrderId,
    pub item_id: OrderItemId,
    pub totals: OrderTotals,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeSet {
    pub order_id: OrderId,
    pub charge: Charge,
    pub totals: OrderTotals,
    pub occurred_at: DateTime<Utc>,
}

/// Status and its history entry change together, in this one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub order_id: OrderId,
    pub from: OrderStatus,
    pub entry: OrderStatusHistory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentStatusChanged {
    pub order_id: OrderId,
    pub from: PaymentStatus,
    pub to: PaymentStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecorded {
    pub order_id: OrderId,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentAdded {
    pub order_id: OrderId,
    pub shipment: Shipment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentStatusChanged {
    pub order_id: OrderId,
    pub shipment_id: ShipmentId,
    pub status: ShipmentStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderPlaced(OrderPlaced),
    ItemAdded(ItemAdded),
    ItemUpdated(ItemUpdated),
    ItemRemoved(ItemRemoved),
    ChargeSet(ChargeSet),
    StatusChanged(StatusChanged),
    PaymentStatusChanged(PaymentStatusChanged),
    TransactionRecorded(TransactionRecorded),
    ShipmentAdded(ShipmentAdded),
    ShipmentStatusChanged(ShipmentStatusChanged),
}

impl OrderEvent {
    pub fn order_id(&self) -> OrderId {
        match self {
            OrderEvent::OrderPlaced(e) => e.order_id,
            OrderEvent::ItemAdded(e) => e.order_id,
            OrderEvent::ItemUpdated(e) => e.order_id,
            OrderEvent::ItemRemoved(e) => e.order_id,
            OrderEvent::ChargeSet(e) => e.order_id,
            OrderEvent::StatusChanged(e) => e.order_id,
            OrderEvent::PaymentStatusChanged(e) => e.order_id,
            OrderEvent::TransactionRecorded(e) => e.order_id,
            OrderEvent::ShipmentAdded(e) => e.order_id,
            OrderEvent::ShipmentStatusChanged(e) => e.order_id,
        }
    }
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderPlaced(_) => "sales.order.placed",
            OrderEvent::ItemAdded(_) => "sales.order.item_added",
            OrderEvent::ItemUpdated(_) => "sales.order.item_updated",
            OrderEvent::ItemRemoved(_) => "sales.order.item_removed",
            OrderEvent::ChargeSet(_) => "sales.order.charge_set",
            OrderEvent::StatusChanged(_) => "sales.order.status_changed",
            OrderEvent::PaymentStatusChanged(_) => "sales.order.payment_status_changed",
            OrderEvent::TransactionRecorded(_) => "sales.order.transaction_recorded",
            OrderEvent::ShipmentAdded(_) => "sales.order.shipment_added",
            OrderEvent::ShipmentStatusChanged(_) => "sales.order.shipment_status_changed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderPlaced(e) => e.entry.created_at,
            OrderEvent::ItemAdded(e) => e.occurred_at,
            OrderEvent::ItemUpdated(e) => e.occurred_at,
            OrderEvent::ItemRemoved(e) => e.occurred_at,
            OrderEvent::ChargeSet(e) => e.occurred_at,
            OrderEvent::StatusChanged(e) => e.entry.created_at,
            OrderEvent::PaymentStatusChanged(e) => e.occurred_at,
            OrderEvent::TransactionRecorded(e) => e.transaction.transaction_date,
            OrderEvent::ShipmentAdded(e) => e.shipment.created_at,
            OrderEvent::ShipmentStatusChanged(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = OrderError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderPlaced(e) => {
                *self = Self::from_placed(e);
            }
            OrderEvent::ItemAdded(e) => {
                self.items.push(e.item.clone());
                self.totals = e.totals.clone();
            }
            OrderEvent::ItemUpdated(e) => {
                if let Some(pos) = position_by_id(&self.items, &e.item.id) {
                    self.items[pos] = e.item.clone();
                }
                self.totals = e.totals.clone();
            }
            OrderEvent::ItemRemoved(e) => {
                self.items.retain(|item| item.id != e.item_id);
                self.totals = e.totals.clone();
            }
            OrderEvent::ChargeSet(e) => {
                self.totals = e.totals.clone();
            }
            OrderEvent::StatusChanged(e) => {
                self.status = e.entry.status;
                self.status_history.push(e.entry.clone());
            }
            OrderEvent::PaymentStatusChanged(e) => {
                self.payment_status = e.to;
            }
            OrderEvent::TransactionRecorded(e) => {
                self.transactions.push(e.transaction.clone());
            }
            OrderEvent::ShipmentAdded(e) => {
                self.shipments.push(e.shipment.clone());
            }
            OrderEvent::ShipmentStatusChanged(e) => {
                if let Some(pos) = position_by_id(&self.shipments, &e.shipment_id) {
                    self.shipments[pos].set_status(e.status, e.occurred_at);
                }
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::AddItem(cmd) => self.handle_add_item(cmd),
            OrderCommand::UpdateItem(cmd) => self.handle_update_item(cmd),
            OrderCommand::RemoveItem(cmd) => self.handle_remove_item(cmd),
            OrderCommand::SetCharge(cmd) => self.handle_set_charge(cmd),
            OrderCommand::ChangeStatus(cmd) => Ok(vec![self.status_change(
                cmd.to,
                &cmd.comment,
                cmd.staff_id,
                cmd.occurred_at,
            )?]),
            OrderCommand::Cancel(cmd) => self.handle_cancel(cmd),
            OrderCommand::UpdatePaymentStatus(cmd) => {
                self.payment_status_change(cmd.status, cmd.occurred_at)
            }
            OrderCommand::RecordPayment(cmd) => self.handle_record_payment(cmd),
            OrderCommand::AddShipment(cmd) => self.handle_add_shipment(cmd),
            OrderCommand::MarkDelivered(cmd) => self.handle_mark_delivered(cmd),
            OrderCommand::FailShipment(cmd) => self.handle_fail_shipment(cmd),
        }
    }
}

impl Order {
    fn ensure_pending(&self) -> Result<(), OrderError> {
        if !self.is_modifiable() {
            return Err(OrderError::NotPending(self.status));
        }
        Ok(())
    }

    fn status_change(
        &self,
        to: OrderStatus,
        comment: &str,
        staff_id: Option<StaffId>,
        at: DateTime<Utc>,
    ) -> Result<OrderEvent, OrderError> {
        if !self.status.can_transition_to(to) {
            return Err(OrderError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        Ok(OrderEvent::StatusChanged(StatusChanged {
            order_id: self.id,
            from: self.status,
            entry: OrderStatusHistory {
                status: to,
                comment: comment.to_string(),
                staff_id,
                created_at: at,
            },
        }))
    }

    /// Paid while pending also moves the order to processing, in the same decision.
    fn payment_status_change(
        &self,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        if to == self.payment_status {
            return Ok(Vec::new());
        }

        let mut events = vec![OrderEvent::PaymentStatusChanged(PaymentStatusChanged {
            order_id: self.id,
            from: self.payment_status,
            to,
            occurred_at: at,
        })];
        if to == PaymentStatus::Paid && self.status == OrderStatus::Pending {
            events.push(self.status_change(
                OrderStatus::Processing,
                "Payment received, order processing",
                None,
                at,
            )?);
        }
        Ok(events)
    }

    fn handle_add_item(&self, cmd: &AddItem) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_pending()?;
        if self.find_item(cmd.item.id).is_some() {
            return Err(OrderError::DuplicateItem(cmd.item.id));
        }

        let item = OrderItem::new(self.id, &cmd.item)?;
        let mut items = self.items.clone();
        items.push(item.clone());
        let totals = self.totals.with_items(&items)?;

        Ok(vec![OrderEvent::ItemAdded(ItemAdded {
            order_id: self.id,
            item,
            totals,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_item(&self, cmd: &UpdateItem) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_pending()?;
        let pos = position_by_id(&self.items, &cmd.item_id)
            .ok_or(OrderError::ItemNotFound(cmd.item_id))?;

        let item = self.items[pos].with_quantity(cmd.quantity)?;
        let mut items = self.items.clone();
        items[pos] = item.clone();
        let totals = self.totals.with_items(&items)?;

        Ok(vec![OrderEvent::ItemUpdated(ItemUpdated {
            order_id: self.id,
            item,
            totals,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_remove_item(&self, cmd: &RemoveItem) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_pending()?;
        if self.find_item(cmd.item_id).is_none() {
            return Err(OrderError::ItemNotFound(cmd.item_id));
        }

        let items: Vec<OrderItem> = self
            .items
            .iter()
            .filter(|item| item.id != cmd.item_id)
            .cloned()
            .collect();
        let totals = self.totals.with_items(&items)?;

        Ok(vec![OrderEvent::ItemRemoved(ItemRemoved {
            order_id: self.id,
            item_id: cmd.item_id,
            totals,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_charge(&self, cmd: &SetCharge) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_pending()?;
        if cmd.amount.is_negative() {
            return Err(OrderError::validation("charge amount cannot be negative"));
        }

        let current = &self.totals;
        let (shipping, tax, discount) = match cmd.charge {
            Charge::ShippingFee => (&cmd.amount, &current.tax_amount, &current.discount_amount),
            Charge::Tax => (&current.shipping_fee, &cmd.amount, &current.discount_amount),
            Charge::Discount => (&current.shipping_fee, &current.tax_amount, &cmd.amount),
        };
        let totals = OrderTotals::compute(&self.items, shipping, tax, discount)?;

        Ok(vec![OrderEvent::ChargeSet(ChargeSet {
            order_id: self.id,
            charge: cmd.charge,
            totals,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelOrder) -> Result<Vec<OrderEvent>, OrderError> {
        if self.status == OrderStatus::Delivered {
            return Err(OrderError::DeliveredCannotBeCancelled);
        }
        Ok(vec![self.status_change(
            OrderStatus::Cancelled,
            &cmd.reason,
            cmd.staff_id,
            cmd.occurred_at,
        )?])
    }

    fn handle_record_payment(&self, cmd: &RecordPayment) -> Result<Vec<OrderEvent>, OrderError> {
        let tx = &cmd.transaction;
        if self.status.is_terminal() {
            return Err(OrderError::Closed(self.status));
        }
        if tx.order_id != self.id {
            return Err(OrderError::validation("transaction belongs to another order"));
        }
        if tx.amount.currency() != self.currency() {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency().to_string(),
                right: tx.amount.currency().to_string(),
            }
            .into());
        }
        if tx.status == PaymentStatus::Paid && self.payment_status == PaymentStatus::Paid {
            return Err(OrderError::AlreadyPaid);
        }

        let mut events = vec![OrderEvent::TransactionRecorded(TransactionRecorded {
            order_id: self.id,
            transaction: tx.clone(),
        })];
        events.extend(self.payment_status_change(tx.status, tx.transaction_date)?);
        Ok(events)
    }

    /// Shipment is created pending, the order moves to shipped, then the shipment ships.
    fn handle_add_shipment(&self, cmd: &AddShipment) -> Result<Vec<OrderEvent>, OrderError> {
        if self.status != OrderStatus::Processing {
            return Err(OrderError::NotProcessing(self.status));
        }

        let shipment = Shipment::new(
            cmd.shipment_id,
            self.id,
            cmd.tracking_number.clone(),
            cmd.carrier.clone(),
            cmd.expected_delivery_date,
            cmd.occurred_at,
        )?;
        let shipped =
            self.status_change(OrderStatus::Shipped, "Order shipped", None, cmd.occurred_at)?;

        Ok(vec![
            OrderEvent::ShipmentAdded(ShipmentAdded {
                order_id: self.id,
                shipment,
            }),
            shipped,
            OrderEvent::ShipmentStatusChanged(ShipmentStatusChanged {
                order_id: self.id,
                shipment_id: cmd.shipment_id,
                status: ShipmentStatus::Shipped,
                occurred_at: cmd.occurred_at,
            }),
        ])
    }

    /// Delivery of the order settles its shipments: every shipment not yet delivered ends
    /// delivered, a failed one included (the goods arrived after all). Pending shipments
    /// pass through shipped first.
    fn handle_mark_delivered(&self, cmd: &MarkDelivered) -> Result<Vec<OrderEvent>, OrderError> {
        if self.status != OrderStatus::Shipped {
            return Err(OrderError::NotShipped(self.status));
        }

        let at = cmd.occurred_at;
        let mut events = Vec::new();
        for shipment in &self.shipments {
            if shipment.status == ShipmentStatus::Pending {
                events.push(self.shipment_status(shipment.id, ShipmentStatus::Shipped, at));
            }
            if shipment.status != ShipmentStatus::Delivered {
                events.push(self.shipment_status(shipment.id, ShipmentStatus::Delivered, at));
            }
        }

        events.push(self.status_change(
            OrderStatus::Delivered,
            "Order delivered",
            cmd.staff_id,
            cmd.occurred_at,
        )?);
        Ok(events)
    }

    fn handle_fail_shipment(&self, cmd: &FailShipment) -> Result<Vec<OrderEvent>, OrderError> {
        let shipment = find_by_id(&self.shipments, &cmd.shipment_id)
            .ok_or(OrderError::ShipmentNotFound(cmd.shipment_id))?;
        shipment.ensure_transition(ShipmentStatus::Failed)?;

        Ok(vec![self.shipment_status(
            cmd.shipment_id,
            ShipmentStatus::Failed,
            cmd.occurred_at,
        )])
    }

    fn shipment_status(
        &self,
        shipment_id: ShipmentId,
        status: ShipmentStatus,
        at: DateTime<Utc>,
    ) -> OrderEvent {
        OrderEvent::ShipmentStatusChanged(ShipmentStatusChanged {
            order_id: self.id,
            shipment_id,
            status,
            occurred_at: at,
        })
    }
}
