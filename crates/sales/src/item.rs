use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use ordercore_core::{
    Entity, Money, MoneyError, OrderId, OrderItemId, ProductId, StaffId, VariantId,
};

use crate::error::OrderError;
use crate::status::OrderStatus;

/// A line of an order: product/variant, quantity and the money it adds up to.
///
/// `subtotal = unit_price * quantity` and `total = subtotal + tax - discount`, the same
/// shape as the order-level total. Tax and discount default to zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: OrderItemId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    pub unit_price: Money,
    pub subtotal: Money,
    pub tax: Money,
    pub discount: Money,
    pub total: Money,
}

impl Entity for OrderItem {
    type Id = OrderItemId;

    fn id(&self) -> &OrderItemId {
        &self.id
    }
}

/// Input for a new order line, before totals are computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub id: OrderItemId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    pub unit_price: Money,
    pub tax: Option<Money>,
    pub discount: Option<Money>,
}

impl NewOrderItem {
    pub fn new(
        product_id: ProductId,
        variant_id: Option<VariantId>,
        sku: impl Into<String>,
        name: impl Into<String>,
        quantity: i64,
        unit_price: Money,
    ) -> Self {
        Self {
            id: OrderItemId::new(),
            product_id,
            variant_id,
            sku: sku.into(),
            name: name.into(),
            quantity,
            unit_price,
            tax: None,
            discount: None,
        }
    }

    pub fn with_tax(mut self, tax: Money) -> Self {
        self.tax = Some(tax);
        self
    }

    pub fn with_discount(mut self, discount: Money) -> Self {
        self.discount = Some(discount);
        self
    }
}

impl OrderItem {
    pub fn new(order_id: OrderId, input: &NewOrderItem) -> Result<Self, OrderError> {
        if input.sku.trim().is_empty() {
            return Err(OrderError::validation("sku is required"));
        }
        if input.name.trim().is_empty() {
            return Err(OrderError::validation("item name is required"));
        }
        ensure_non_negative("unit price", &input.unit_price)?;

        let tax = input.tax.clone().unwrap_or_else(|| input.unit_price.zeroed());
        let discount = input
            .discount
            .clone()
            .unwrap_or_else(|| input.unit_price.zeroed());
        ensure_non_negative("item tax", &tax)?;
        ensure_non_negative("item discount", &discount)?;

        let mut item = Self {
            id: input.id,
            order_id,
            product_id: input.product_id,
            variant_id: input.variant_id,
            sku: input.sku.clone(),
            name: input.name.clone(),
            quantity: 0,
            subtotal: input.unit_price.zeroed(),
            total: input.unit_price.zeroed(),
            unit_price: input.unit_price.clone(),
            tax,
            discount,
        };
        item.recalculate(input.quantity)?;
        Ok(item)
    }

    /// Copy of this line with a new quantity and recomputed totals.
    pub fn with_quantity(&self, quantity: i64) -> Result<Self, OrderError> {
        let mut item = self.clone();
        item.recalculate(quantity)?;
        Ok(item)
    }

    fn recalculate(&mut self, quantity: i64) -> Result<(), OrderError> {
        if quantity <= 0 {
            return Err(OrderError::InvalidQuantity(quantity));
        }
        let subtotal = self.unit_price.multiply(Decimal::from(quantity))?;
        let total = subtotal.add(&self.tax)?.subtract(&self.discount)?;

        self.quantity = quantity;
        self.subtotal = subtotal;
        self.total = total;
        Ok(())
    }
}

fn ensure_non_negative(what: &str, money: &Money) -> Result<(), OrderError> {
    if money.is_negative() {
        return Err(OrderError::validation(format!("{what} cannot be negative")));
    }
    Ok(())
}

/// The five money fields of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: Money,
    pub shipping_fee: Money,
    pub tax_amount: Money,
    pub discount_amount: Money,
    pub total_amount: Money,
}

impl OrderTotals {
    pub fn zero(currency: &str) -> Result<Self, MoneyError> {
        let zero = Money::zero(currency)?;
        Ok(Self {
            subtotal: zero.clone(),
            shipping_fee: zero.clone(),
            tax_amount: zero.clone(),
            discount_amount: zero.clone(),
            total_amount: zero,
        })
    }

    /// `subtotal = Σ items.total`, `total = subtotal + shipping + tax - discount`.
    pub fn compute(
        items: &[OrderItem],
        shipping_fee: &Money,
        tax_amount: &Money,
        discount_amount: &Money,
    ) -> Result<Self, MoneyError> {
        let subtotal = items
            .iter()
            .try_fold(shipping_fee.zeroed(), |acc, item| acc.add(&item.total))?;
        let total_amount = subtotal
            .add(shipping_fee)?
            .add(tax_amount)?
            .subtract(discount_amount)?;

        Ok(Self {
            subtotal,
            shipping_fee: shipping_fee.clone(),
            tax_amount: tax_amount.clone(),
            discount_amount: discount_amount.clone(),
            total_amount,
        })
    }

    /// Same fees, new line set.
    pub fn with_items(&self, items: &[OrderItem]) -> Result<Self, MoneyError> {
        Self::compute(
            items,
            &self.shipping_fee,
            &self.tax_amount,
            &self.discount_amount,
        )
    }
}

/// Append-only audit entry written on order creation and on every status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusHistory {
    pub status: OrderStatus,
    pub comment: String,
    pub staff_id: Option<StaffId>,
    pub created_at: DateTime<Utc>,
}
