//! Response Extraction
//!
//! Turns a decoded JSON response body into a polled [`ValueUpdate`]. Each
//! endpoint carries one [`Extractor`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::application::ports::FetchError;
use crate::domain::update::{LogicalKey, SyncValue, ValueUpdate, parse_observed_at};

/// Extraction function: `(key, body, received_at) -> update`.
pub type Extractor =
    Arc<dyn Fn(&LogicalKey, Value, DateTime<Utc>) -> Result<ValueUpdate, FetchError> + Send + Sync>;

/// Where a record's `observed_at` comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSource {
    /// A top-level string field of the body. Missing means malformed.
    Field(&'static str),
    /// The local receive time. Only for endpoints that never carry one.
    ReceivedAt,
}

/// Extractor for `/data/latest-price`:
/// `{"currency_pair", "price", "timestamp"}`. A null price means no data.
#[must_use]
pub fn latest_price() -> Extractor {
    Arc::new(|key: &LogicalKey, body: Value, _received_at: DateTime<Utc>| {
        let price = match body.get("price") {
            None => return Err(FetchError::Malformed("missing field price".into())),
            Some(Value::Null) => return Err(FetchError::NoData),
            Some(price) => SyncValue::from_json(price.clone()),
        };
        if price.as_number().is_none() {
            return Err(FetchError::Malformed("price is not a number".into()));
        }

        if let Some(pair) = body.get("currency_pair").and_then(Value::as_str) {
            if pair != key.as_str() {
                return Err(FetchError::Malformed(format!(
                    "response is for {pair}, expected {key}"
                )));
            }
        }

        let observed_at = field_timestamp(&body, "timestamp")?;
        Ok(ValueUpdate::poll(key.clone(), price, observed_at))
    })
}

/// Extractor keeping the whole body as a record.
#[must_use]
pub fn record(timestamp: TimestampSource) -> Extractor {
    Arc::new(move |key: &LogicalKey, body: Value, received_at: DateTime<Utc>| {
        if body.is_null() {
            return Err(FetchError::NoData);
        }
        let observed_at = match timestamp {
            TimestampSource::Field(field) => field_timestamp(&body, field)?,
            TimestampSource::ReceivedAt => received_at,
        };
        Ok(ValueUpdate::poll(key.clone(), SyncValue::Record(body), observed_at))
    })
}

/// Extractor for list endpoints. The whole list is the record; its
/// `observed_at` is the newest `item_field` among the items.
#[must_use]
pub fn newest_item(item_field: &'static str) -> Extractor {
    Arc::new(move |key: &LogicalKey, body: Value, _received_at: DateTime<Utc>| {
        let items = body
            .as_array()
            .ok_or_else(|| FetchError::Malformed("expected a JSON array".into()))?;
        if items.is_empty() {
            return Err(FetchError::NoData);
        }

        let newest = items
            .iter()
            .filter_map(|item| item.get(item_field).and_then(Value::as_str))
            .filter_map(parse_observed_at)
            .max()
            .ok_or_else(|| {
                FetchError::Malformed(format!("no item carries a valid {item_field}"))
            })?;

        Ok(ValueUpdate::poll(key.clone(), SyncValue::Record(body), newest))
    })
}

fn field_timestamp(body: &Value, field: &'static str) -> Result<DateTime<Utc>, FetchError> {
    let raw = body
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| FetchError::Malformed(format!("missing field {field}")))?;
    parse_observed_at(raw).ok_or_else(|| FetchError::Malformed(format!("invalid {field}: {raw}")))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::*;
    use crate::domain::update::Origin;

    fn key(raw: &str) -> LogicalKey {
        LogicalKey::new(raw).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap()
    }

    #[test]
    fn latest_price_extracts_number() {
        let body = json!({
            "currency_pair": "USD/LYD",
            "price": 4.85,
            "price_type": "buy",
            "timestamp": "2024-03-01T12:30:00",
            "source": "channel"
        });
        let update = latest_price()(&key("USD/LYD"), body, now()).unwrap();

        assert_eq!(update.value().as_number(), Some(Decimal::new(485, 2)));
        assert_eq!(update.origin(), Origin::Poll);
        assert_eq!(update.observed_at(), Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap());
    }

    #[test]
    fn latest_price_without_data() {
        let body = json!({"currency_pair": "USD/LYD", "price": null, "timestamp": null});
        assert_eq!(
            latest_price()(&key("USD/LYD"), body, now()),
            Err(FetchError::NoData)
        );
    }

    #[test]
    fn latest_price_rejects_other_pair_and_missing_timestamp() {
        let other = json!({"currency_pair": "EUR/LYD", "price": 5.1, "timestamp": "2024-03-01T12:00:00"});
        assert!(matches!(
            latest_price()(&key("USD/LYD"), other, now()),
            Err(FetchError::Malformed(_))
        ));

        let untimed = json!({"currency_pair": "USD/LYD", "price": 5.1});
        assert!(matches!(
            latest_price()(&key("USD/LYD"), untimed, now()),
            Err(FetchError::Malformed(_))
        ));
    }

    #[test]
    fn record_timestamp_sources() {
        let body = json!({"signal": "BUY", "confidence": 0.7});

        let received = record(TimestampSource::ReceivedAt)(&key("signal:USD/LYD"), body.clone(), now()).unwrap();
        assert_eq!(received.observed_at(), now());
        assert_eq!(received.value().as_record(), Some(&body));

        assert!(matches!(
            record(TimestampSource::Field("timestamp"))(&key("signal:USD/LYD"), body, now()),
            Err(FetchError::Malformed(_))
        ));

        let panic = json!({"market_panic_index": 42, "timestamp": "2024-03-01T12:45:00Z"});
        let update = record(TimestampSource::Field("timestamp"))(&key("panic-index"), panic, now()).unwrap();
        assert_eq!(update.observed_at(), Utc.with_ymd_and_hms(2024, 3, 1, 12, 45, 0).unwrap());
    }

    #[test]
    fn newest_item_uses_latest_timestamp() {
        let body = json!([
            {"id": 2, "text": "b", "timestamp": "2024-03-01T12:10:00"},
            {"id": 3, "text": "c", "timestamp": "2024-03-01T12:20:00"},
            {"id": 1, "text": "a", "timestamp": "2024-03-01T12:00:00"}
        ]);
        let update = newest_item("timestamp")(&key("messages"), body, now()).unwrap();
        assert_eq!(update.observed_at(), Utc.with_ymd_and_hms(2024, 3, 1, 12, 20, 0).unwrap());

        let daily = json!([{"date": "2024-02-28", "close": 4.8}, {"date": "2024-02-29", "close": 4.9}]);
        let update = newest_item("date")(&key("daily:USD/LYD"), daily, now()).unwrap();
        assert_eq!(update.observed_at(), Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());
    }

    #[test]
    fn newest_item_edge_cases() {
        assert_eq!(
            newest_item("timestamp")(&key("messages"), json!([]), now()),
            Err(FetchError::NoData)
        );
        assert!(matches!(
            newest_item("timestamp")(&key("messages"), json!({"items": []}), now()),
            Err(FetchError::Malformed(_))
        ));
        assert!(matches!(
            newest_item("timestamp")(&key("messages"), json!([{"id": 1}]), now()),
            Err(FetchError::Malformed(_))
        ));
    }
}
