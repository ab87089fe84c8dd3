use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use ordercore_core::{Entity, Money, MoneyError, OrderId, PaymentMethodId, TransactionId};

use crate::error::OrderError;
use crate::status::PaymentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeesType {
    Fixed,
    Percentage,
}

/// A payment option customers can pick at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: PaymentMethodId,
    pub name: String,
    pub description: String,
    pub is_active: bool,
    pub fees_type: FeesType,
    /// Flat amount for [`FeesType::Fixed`], percent for [`FeesType::Percentage`].
    pub fees_amount: Decimal,
    pub sort_order: i32,
}

impl Entity for PaymentMethod {
    type Id = PaymentMethodId;

    fn id(&self) -> &PaymentMethodId {
        &self.id
    }
}

impl PaymentMethod {
    pub fn new(id: PaymentMethodId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: String::new(),
            is_active: true,
            fees_type: FeesType::Fixed,
            fees_amount: Decimal::ZERO,
            sort_order: 0,
        }
    }

    pub fn with_fee(mut self, fees_type: FeesType, fees_amount: Decimal) -> Self {
        self.fees_type = fees_type;
        self.fees_amount = fees_amount;
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Surcharge for paying `amount` with this method, in the same currency.
    ///
    /// Inactive methods and non-positive fee settings charge nothing.
    pub fn calculate_payment_fee(&self, amount: &Money) -> Result<Money, MoneyError> {
        if !self.is_active || self.fees_amount <= Decimal::ZERO {
            return Ok(amount.zeroed());
        }
        match self.fees_type {
            FeesType::Fixed => Ok(amount.with_amount(self.fees_amount)),
            FeesType::Percentage => amount.multiply(self.fees_amount / Decimal::ONE_HUNDRED),
        }
    }
}

/// One payment attempt against an order. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub order_id: OrderId,
    pub payment_method_id: PaymentMethodId,
    pub transaction_date: DateTime<Utc>,
    pub amount: Money,
    pub status: PaymentStatus,
    pub reference_number: String,
    pub gateway_response: String,
    pub gateway_transaction_id: String,
}

impl Entity for Transaction {
    type Id = TransactionId;

    fn id(&self) -> &TransactionId {
        &self.id
    }
}

impl Transaction {
    pub fn new(
        order_id: OrderId,
        payment_method_id: PaymentMethodId,
        amount: Money,
        status: PaymentStatus,
        transaction_date: DateTime<Utc>,
    ) -> Result<Self, OrderError> {
        if amount.is_negative() {
            return Err(OrderError::validation("transaction amount cannot be negative"));
        }
        Ok(Self {
            id: TransactionId::new(),
            order_id,
            payment_method_id,
            transaction_date,
            amount,
            status,
            reference_number: String::new(),
            gateway_response: String::new(),
            gateway_transaction_id: String::new(),
        })
    }

    pub fn with_gateway(
        mut self,
        reference_number: impl Into<String>,
        gateway_transaction_id: impl Into<String>,
        gateway_response: impl Into<String>,
    ) -> Self {
        self.reference_number = reference_number.into();
        self.gateway_transaction_id = gateway_transaction_id.into();
        self.gateway_response = gateway_response.into();
        self
    }
}
