//! Transaction domain types and request validation

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ValidationCode;
use crate::{Result, ServerError};

/// Default number of rows per page
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Largest accepted page size
pub const MAX_PAGE_SIZE: u32 = 100;

/// A stored transaction row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub sequence_id: i64,
    pub coin_symbol: String,
    pub transaction_type: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub quantity: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub price_per_unit: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_cost: Decimal,
    pub transaction_date: NaiveDate,
    pub exchange: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /api/{database_id}/crypto/transactions`.
///
/// Fields are optional here so that a missing field reports its own
/// validation code instead of a generic JSON error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateTransactionRequest {
    #[serde(default)]
    pub coin_symbol: Option<String>,
    #[serde(default)]
    pub transaction_type: Option<String>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub quantity: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub price_per_unit: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub total_cost: Option<Decimal>,
    #[serde(default)]
    pub transaction_date: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A validated transaction ready to insert
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub coin_symbol: String,
    pub transaction_type: String,
    pub quantity: Decimal,
    pub price_per_unit: Decimal,
    pub total_cost: Decimal,
    pub transaction_date: NaiveDate,
    pub exchange: String,
    pub notes: Option<String>,
}

impl CreateTransactionRequest {
    /// Parse a raw request body
    pub fn from_json(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| {
            ServerError::validation_error(
                ValidationCode::InvalidJson,
                format!("Invalid JSON body: {}", e),
            )
        })
    }

    /// Check fields in a fixed order, stopping at the first problem
    pub fn validate(self) -> Result<NewTransaction> {
        let transaction_date = parse_date(self.transaction_date.as_deref().unwrap_or_default())?;

        let coin_symbol = non_empty(self.coin_symbol).ok_or_else(|| {
            ServerError::validation_error(
                ValidationCode::MissingCoinSymbol,
                "coin_symbol is required".to_string(),
            )
        })?;

        let transaction_type = non_empty(self.transaction_type).ok_or_else(|| {
            ServerError::validation_error(
                ValidationCode::MissingTransactionType,
                "transaction_type is required".to_string(),
            )
        })?;

        let quantity = self.quantity.filter(|q| *q > Decimal::ZERO).ok_or_else(|| {
            ServerError::validation_error(
                ValidationCode::InvalidQuantity,
                "quantity must be greater than 0".to_string(),
            )
        })?;

        let price_per_unit = self.price_per_unit.unwrap_or_default();
        if price_per_unit < Decimal::ZERO {
            return Err(ServerError::validation_error(
                ValidationCode::InvalidPrice,
                "price_per_unit cannot be negative".to_string(),
            ));
        }

        let total_cost = self.total_cost.unwrap_or_default();
        if total_cost < Decimal::ZERO {
            return Err(ServerError::validation_error(
                ValidationCode::InvalidTotalCost,
                "total_cost cannot be negative".to_string(),
            ));
        }

        Ok(NewTransaction {
            coin_symbol,
            transaction_type,
            quantity,
            price_per_unit,
            total_cost,
            transaction_date,
            exchange: self.exchange.unwrap_or_default(),
            notes: non_empty(self.notes),
        })
    }
}

/// Accepts exactly `YYYY-MM-DD`
fn parse_date(raw: &str) -> Result<NaiveDate> {
    let invalid = || {
        ServerError::validation_error(
            ValidationCode::InvalidDateFormat,
            "transaction_date must be in YYYY-MM-DD format".to_string(),
        )
    };

    // chrono alone would also accept unpadded forms like 2024-1-5
    if raw.len() != 10 {
        return Err(invalid());
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| invalid())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Page of a list query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// Build from raw query values. Missing or unparsable values fall back to
    /// the defaults and an oversized page is clamped to the maximum.
    pub fn from_raw(page: Option<&str>, page_size: Option<&str>) -> Self {
        let page = page
            .and_then(|p| p.trim().parse::<i64>().ok())
            .filter(|p| *p >= 1)
            .map(|p| p.min(u32::MAX as i64) as u32)
            .unwrap_or(1);

        let page_size = match page_size.and_then(|s| s.trim().parse::<i64>().ok()) {
            Some(size) if size > MAX_PAGE_SIZE as i64 => MAX_PAGE_SIZE,
            Some(size) if size >= 1 => size as u32,
            _ => DEFAULT_PAGE_SIZE,
        };

        Self { page, page_size }
    }

    /// Rows to skip
    pub fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.page_size as u64
    }

    pub fn limit(&self) -> u64 {
        self.page_size as u64
    }
}

/// Response body of a list request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionPage {
    pub data: Vec<Transaction>,
    pub page: u32,
    pub page_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;

    fn request(body: &str) -> Result<NewTransaction> {
        CreateTransactionRequest::from_json(body.as_bytes())?.validate()
    }

    fn code(result: Result<NewTransaction>) -> &'static str {
        result.unwrap_err().error_code()
    }

    const VALID: &str = r#"{
        "coin_symbol": "BTC",
        "transaction_type": "BUY",
        "quantity": 0.5,
        "price_per_unit": 42000,
        "total_cost": 21000,
        "transaction_date": "2024-01-15",
        "exchange": "Coinbase",
        "notes": ""
    }"#;

    #[test]
    fn test_valid_request() {
        let tx = request(VALID).unwrap();

        assert_eq!(tx.coin_symbol, "BTC");
        assert_eq!(tx.quantity, Decimal::from_str("0.5").unwrap());
        assert_eq!(tx.total_cost, Decimal::from(21000));
        assert_eq!(tx.transaction_date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert_eq!(tx.notes, None);
    }

    #[test]
    fn test_invalid_json() {
        assert_eq!(code(request("{not json")), "INVALID_JSON");
        assert_eq!(code(request(r#"{"quantity": "lots"}"#)), "INVALID_JSON");
    }

    #[test]
    fn test_date_formats() {
        for bad in ["01/15/2024", "2024-1-15", "2024-13-01", "2024-02-30", ""] {
            let body = VALID.replace("2024-01-15", bad);
            assert_eq!(code(request(&body)), "INVALID_DATE_FORMAT", "date {:?}", bad);
        }

        assert_eq!(code(request(r#"{"coin_symbol": "BTC"}"#)), "INVALID_DATE_FORMAT");
    }

    #[test]
    fn test_validation_order() {
        // Date is checked before the symbol
        assert_eq!(
            code(request(r#"{"transaction_date": "15-01-2024", "quantity": -1}"#)),
            "INVALID_DATE_FORMAT"
        );

        let body = VALID.replace("\"BTC\"", "\"\"");
        assert_eq!(code(request(&body)), "MISSING_COIN_SYMBOL");

        let body = VALID.replace("\"BUY\"", "\"  \"");
        assert_eq!(code(request(&body)), "MISSING_TRANSACTION_TYPE");

        let body = VALID.replace("0.5", "0");
        assert_eq!(code(request(&body)), "INVALID_QUANTITY");

        let body = VALID.replace("42000", "-1");
        assert_eq!(code(request(&body)), "INVALID_PRICE");

        let body = VALID.replace("21000", "-0.01");
        assert_eq!(code(request(&body)), "INVALID_TOTAL_COST");
    }

    #[test]
    fn test_zero_price_is_allowed() {
        let body = VALID.replace("42000", "0").replace("21000", "0");
        assert!(request(&body).is_ok());
    }

    #[test]
    fn test_notes_are_kept_when_present() {
        let body = VALID.replace("\"notes\": \"\"", "\"notes\": \"DCA\"");
        assert_eq!(request(&body).unwrap().notes.as_deref(), Some("DCA"));
    }

    #[test]
    fn test_page_defaults_and_clamps() {
        let page = |page, page_size| PageRequest { page, page_size };

        assert_eq!(PageRequest::from_raw(None, None), page(1, 20));
        assert_eq!(PageRequest::from_raw(Some("abc"), Some("xyz")), page(1, 20));
        assert_eq!(PageRequest::from_raw(Some("0"), Some("0")), page(1, 20));
        assert_eq!(PageRequest::from_raw(Some("-3"), Some("-5")), page(1, 20));
        assert_eq!(PageRequest::from_raw(Some("3"), Some("500")), page(3, 100));
        assert_eq!(PageRequest::from_raw(Some("2"), Some("10")).offset(), 10);
    }

    proptest! {
        #[test]
        fn prop_page_request_is_always_in_range(
            page in any::<Option<String>>(),
            size in any::<Option<String>>()
        ) {
            let req = PageRequest::from_raw(page.as_deref(), size.as_deref());
            prop_assert!(req.page >= 1);
            prop_assert!(req.page_size >= 1 && req.page_size <= MAX_PAGE_SIZE);
        }

        #[test]
        fn prop_numeric_page_size_is_clamped(size in -1000i64..1000) {
            let req = PageRequest::from_raw(None, Some(&size.to_string()));
            let expected = if size < 1 { DEFAULT_PAGE_SIZE } else { size.min(100) as u32 };
            prop_assert_eq!(req.page_size, expected);
        }
    }
}
