//! Semantic view over raw energy-meter records.
//!
//! Devices report readings under a unit-suffix convention: `voltage` is in
//! volts while `voltage_mv` is millivolts, and different generations
//! populate different variants. The accessors here auto-scale: the native
//! key wins when present, otherwise the counterpart is converted by a
//! factor of 1000. A key the convention does not know is a lookup error;
//! a known key that the record simply lacks reads as `None`.

use serde_json::{Map, Value};

use crate::error::Error;

/// The key pairs the convention covers, `(base, milli)`.
const KEY_PAIRS: &[(&str, &str)] = &[
    ("voltage", "voltage_mv"),
    ("current", "current_ma"),
    ("power", "power_mw"),
    ("total", "total_wh"),
];

/// A raw emeter record with scaling accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct EmeterStatus {
    raw: Map<String, Value>,
}

impl EmeterStatus {
    /// Wraps a raw record.
    pub fn new(raw: Map<String, Value>) -> Self {
        Self { raw }
    }

    /// Wraps the object inside a JSON value, if it is one.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_object().cloned().map(Self::new)
    }

    /// Voltage in volts.
    pub fn voltage(&self) -> Option<f64> {
        self.lookup("voltage")
    }

    /// Voltage in millivolts.
    pub fn voltage_mv(&self) -> Option<f64> {
        self.lookup("voltage_mv")
    }

    /// Current in amperes.
    pub fn current(&self) -> Option<f64> {
        self.lookup("current")
    }

    /// Current in milliamperes.
    pub fn current_ma(&self) -> Option<f64> {
        self.lookup("current_ma")
    }

    /// Power in watts.
    pub fn power(&self) -> Option<f64> {
        self.lookup("power")
    }

    /// Power in milliwatts.
    pub fn power_mw(&self) -> Option<f64> {
        self.lookup("power_mw")
    }

    /// Total consumption in kilowatt-hours.
    pub fn total(&self) -> Option<f64> {
        self.lookup("total")
    }

    /// Total consumption in watt-hours.
    pub fn total_wh(&self) -> Option<f64> {
        self.lookup("total_wh")
    }

    /// Looks up a reading by key, scaling from the counterpart variant when
    /// the native key is absent.
    pub fn get(&self, key: &str) -> Result<Option<f64>, Error> {
        let Some((base, milli)) = KEY_PAIRS
            .iter()
            .find(|(base, milli)| key == *base || key == *milli)
        else {
            return Err(Error::Protocol(format!("unknown emeter key: {key}")));
        };

        if let Some(native) = self.raw.get(key).and_then(Value::as_f64) {
            return Ok(Some(native));
        }
        let counterpart = if key == *base { milli } else { base };
        let Some(value) = self.raw.get(*counterpart).and_then(Value::as_f64) else {
            return Ok(None);
        };
        Ok(Some(if key == *base {
            value / 1000.0
        } else {
            value * 1000.0
        }))
    }

    fn lookup(&self, key: &str) -> Option<f64> {
        self.get(key).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status(value: Value) -> EmeterStatus {
        EmeterStatus::from_value(&value).unwrap()
    }

    #[test]
    fn test_native_key_wins() {
        let status = status(json!({"voltage": 230.5, "voltage_mv": 999_999}));
        assert_eq!(status.voltage(), Some(230.5));
        assert_eq!(status.voltage_mv(), Some(999_999.0));
    }

    #[test]
    fn test_base_derived_from_milli() {
        let status = status(json!({"voltage_mv": 231_500, "power_mw": 4_200}));
        assert_eq!(status.voltage(), Some(231.5));
        assert_eq!(status.power(), Some(4.2));
        assert_eq!(status.current(), None);
    }

    #[test]
    fn test_milli_derived_from_base() {
        let status = status(json!({"current": 0.151, "total": 1.234}));
        assert_eq!(status.current_ma(), Some(151.0));
        assert_eq!(status.total_wh(), Some(1234.0));
    }

    #[test]
    fn test_missing_key_is_none() {
        let status = status(json!({}));
        assert_eq!(status.voltage(), None);
        assert_eq!(status.get("total_wh").unwrap(), None);
    }

    #[test]
    fn test_unknown_key_is_error() {
        let status = status(json!({"voltage": 230}));
        assert!(status.get("frequency").is_err());
        assert!(status.get("voltage_kv").is_err());
    }
}
