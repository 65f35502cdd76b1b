use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from constructing or combining [`Money`] values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),

    #[error("Amount must be non-negative: {0}")]
    NegativeAmount(Decimal),

    #[error("Currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: String, right: String },

    #[error("Subtraction underflow: {minuend} - {subtrahend}")]
    Underflow {
        minuend: Decimal,
        subtrahend: Decimal,
    },

    #[error("Multiplication factor must be non-negative: {0}")]
    NegativeFactor(Decimal),
}

/// Immutable amount-plus-currency value object.
///
/// Arithmetic is checked: mixing currencies, subtracting below zero, and
/// scaling by a negative factor are all rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: String,
}

impl Money {
    pub fn new(amount: Decimal, currency: impl Into<String>) -> Result<Self, MoneyError> {
        let currency = currency.into();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(MoneyError::InvalidCurrency(currency));
        }
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(MoneyError::NegativeAmount(amount));
        }
        Ok(Self {
            amount,
            currency: currency.to_uppercase(),
        })
    }

    pub fn zero(currency: impl Into<String>) -> Result<Self, MoneyError> {
        Self::new(Decimal::ZERO, currency)
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_currency(other)?;
        Ok(Self {
            amount: self.amount + other.amount,
            currency: self.currency.clone(),
        })
    }

    pub fn sub(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_currency(other)?;
        if other.amount > self.amount {
            return Err(MoneyError::Underflow {
                minuend: self.amount,
                subtrahend: other.amount,
            });
        }
        Ok(Self {
            amount: self.amount - other.amount,
            currency: self.currency.clone(),
        })
    }

    pub fn mul(&self, factor: Decimal) -> Result<Money, MoneyError> {
        if factor.is_sign_negative() && !factor.is_zero() {
            return Err(MoneyError::NegativeFactor(factor));
        }
        Ok(Self {
            amount: self.amount * factor,
            currency: self.currency.clone(),
        })
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

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}
