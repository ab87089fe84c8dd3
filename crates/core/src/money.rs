//! Money value object: currency-tagged, fixed-point (2 fractional digits) amounts.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{DomainError, ErrorKind};

/// Number of fractional digits every `Money` amount is rounded to.
pub const MONEY_SCALE: u32 = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("currency cannot be empty")]
    EmptyCurrency,

    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: String, right: String },

    #[error("amount out of range")]
    Overflow,
}

impl MoneyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MoneyError::EmptyCurrency | MoneyError::Overflow => ErrorKind::Validation,
            MoneyError::CurrencyMismatch { .. } => ErrorKind::CurrencyMismatch,
        }
    }
}

impl From<MoneyError> for DomainError {
    fn from(value: MoneyError) -> Self {
        match value {
            MoneyError::EmptyCurrency | MoneyError::Overflow => {
                DomainError::validation(value.to_string())
            }
            MoneyError::CurrencyMismatch { .. } => DomainError::CurrencyMismatch(value.to_string()),
        }
    }
}

/// An amount of a single currency.
///
/// Immutable: every operation returns a new value. The amount is rounded half away from
/// zero to [`MONEY_SCALE`] digits on construction and after every arithmetic operation.
/// The currency is an opaque tag; it is only ever compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "UncheckedMoney")]
pub struct Money {
    amount: Decimal,
    currency: String,
}

/// Wire form; deserialisation goes through [`Money::new`] so the invariants hold.
#[derive(Deserialize)]
struct UncheckedMoney {
    amount: Decimal,
    currency: String,
}

impl TryFrom<UncheckedMoney> for Money {
    type Error = MoneyError;

    fn try_from(value: UncheckedMoney) -> Result<Self, Self::Error> {
        Money::new(value.amount, value.currency)
    }
}

impl Money {
    pub fn new(amount: Decimal, currency: impl Into<String>) -> Result<Self, MoneyError> {
        let currency = currency.into();
        if currency.trim().is_empty() {
            return Err(MoneyError::EmptyCurrency);
        }
        Ok(Self::rounded(amount, currency))
    }

    pub fn zero(currency: impl Into<String>) -> Result<Self, MoneyError> {
        Self::new(Decimal::ZERO, currency)
    }

    /// Zero in the same currency as `self`.
    pub fn zeroed(&self) -> Money {
        self.with_amount(Decimal::ZERO)
    }

    /// Another amount in the same currency as `self`.
    pub fn with_amount(&self, amount: Decimal) -> Money {
        Self::rounded(amount, self.currency.clone())
    }

    fn rounded(amount: Decimal, currency: String) -> Self {
        let mut amount =
            amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
        amount.rescale(MONEY_SCALE);
        Self { amount, currency }
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_currency(other)?;
        let sum = self.amount.checked_add(other.amount).ok_or(MoneyError::Overflow)?;
        Ok(Self::rounded(sum, self.currency.clone()))
    }

    pub fn subtract(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_currency(other)?;
        let difference = self.amount.checked_sub(other.amount).ok_or(MoneyError::Overflow)?;
        Ok(Self::rounded(difference, self.currency.clone()))
    }

    /// Scale by an arbitrary factor (any sign). The currency is preserved.
    pub fn multiply(&self, factor: Decimal) -> Result<Money, MoneyError> {
        let product = self.amount.checked_mul(factor).ok_or(MoneyError::Overflow)?;
        Ok(Self::rounded(product, self.currency.clone()))
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.amount < Decimal::ZERO
    }

    pub fn equals(&self, other: &Money) -> bool {
        self.amount == other.amount && self.currency == other.currency
    }

    fn ensure_same_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch {
                left: self.currency.clone(),
                right: other.currency.clone(),
            });
        }
        Ok(())
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}
