//! Money, supported currencies, and normalization into the reference currency.

use core::fmt;
use core::str::FromStr;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// Currencies an order may be paid in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Cny,
    Usd,
    Cad,
    Sgd,
    Aud,
}

impl Currency {
    /// The currency every amount is normalized into for scoring.
    pub const REFERENCE: Currency = Currency::Cad;

    pub const ALL: [Currency; 5] = [
        Currency::Cny,
        Currency::Usd,
        Currency::Cad,
        Currency::Sgd,
        Currency::Aud,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Currency::Cny => "CNY",
            Currency::Usd => "USD",
            Currency::Cad => "CAD",
            Currency::Sgd => "SGD",
            Currency::Aud => "AUD",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::ALL
            .into_iter()
            .find(|c| c.code().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::validation(format!("unsupported currency: {s}")))
    }
}

/// A positive amount in the currency's minor unit (cents).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    minor_units: i64,
    currency: Currency,
}

impl ValueObject for Money {}

impl Money {
    /// Build a money value; amounts must be strictly positive.
    pub fn from_minor(minor_units: i64, currency: Currency) -> DomainResult<Self> {
        if minor_units <= 0 {
            return Err(DomainError::validation("amount must be positive"));
        }
        Ok(Self {
            minor_units,
            currency,
        })
    }

    pub fn minor_units(&self) -> i64 {
        self.minor_units
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    /// Amount in major units (e.g. dollars).
    pub fn major(&self) -> f64 {
        self.minor_units as f64 / 100.0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {}", self.major(), self.currency)
    }
}

/// Conversion factors from each currency into the reference currency.
///
/// A rate of `1.35` for USD means one USD is worth 1.35 CAD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRates {
    to_reference: HashMap<Currency, f64>,
}

impl Default for ExchangeRates {
    fn default() -> Self {
        let to_reference = HashMap::from([
            (Currency::Cad, 1.0),
            (Currency::Usd, 1.35),
            (Currency::Cny, 0.18),
            (Currency::Sgd, 1.0),
            (Currency::Aud, 0.9),
        ]);
        Self { to_reference }
    }
}

impl ExchangeRates {
    /// Replace the rate for a currency. The reference currency is pinned at 1.0.
    pub fn with_rate(mut self, currency: Currency, rate: f64) -> DomainResult<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(DomainError::validation(format!(
                "exchange rate for {currency} must be positive"
            )));
        }
        if currency == Currency::REFERENCE && rate != 1.0 {
            return Err(DomainError::validation(
                "reference currency rate is fixed at 1.0",
            ));
        }
        self.to_reference.insert(currency, rate);
        Ok(self)
    }

    pub fn rate(&self, currency: Currency) -> Option<f64> {
        self.to_reference.get(&currency).copied()
    }

    /// Convert an amount into the reference currency (major units).
    pub fn normalize(&self, money: &Money) -> DomainResult<f64> {
        let rate = self.rate(money.currency()).ok_or_else(|| {
            DomainError::validation(format!("no exchange rate for {}", money.currency()))
        })?;
        Ok(money.major() * rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_amounts() {
        assert!(Money::from_minor(0, Currency::Cad).is_err());
        assert!(Money::from_minor(-500, Currency::Usd).is_err());
        assert!(Money::from_minor(1, Currency::Usd).is_ok());
    }

    #[test]
    fn parses_currency_codes_case_insensitively() {
        assert_eq!("cad".parse::<Currency>().unwrap(), Currency::Cad);
        assert_eq!(" USD ".parse::<Currency>().unwrap(), Currency::Usd);
        assert!(matches!(
            "EUR".parse::<Currency>(),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn normalizes_into_reference_currency() {
        let rates = ExchangeRates::default();
        let cad = Money::from_minor(10_000, Currency::Cad).unwrap();
        let usd = Money::from_minor(10_000, Currency::Usd).unwrap();

        assert_eq!(rates.normalize(&cad).unwrap(), 100.0);
        assert!((rates.normalize(&usd).unwrap() - 135.0).abs() < 1e-9);
    }

    #[test]
    fn reference_rate_is_pinned() {
        assert!(ExchangeRates::default().with_rate(Currency::Cad, 2.0).is_err());
        assert!(ExchangeRates::default().with_rate(Currency::Usd, 0.0).is_err());

        let rates = ExchangeRates::default().with_rate(Currency::Usd, 1.4).unwrap();
        assert_eq!(rates.rate(Currency::Usd), Some(1.4));
    }

    #[test]
    fn currency_serializes_as_code() {
        let json = serde_json::to_string(&Currency::Sgd).unwrap();
        assert_eq!(json, "\"SGD\"");
    }
}
