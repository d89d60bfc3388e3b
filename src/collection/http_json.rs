//! Remote JSON endpoint used as a sensor (e.g. a weather service's open data
//! feed).

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    module::Collection,
    outcome::{ModuleError, Outcome, TransportError},
    store::ReadingStore,
};

pub const KIND: &str = "http-json";

#[derive(Debug, Clone, Deserialize)]
pub struct HttpJsonSettings {
    pub url: String,
    /// JSON pointer to the array of records.
    pub records_pointer: String,
    /// Field/value pairs the selected record must carry.
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    #[serde(default = "defaults::value_field")]
    pub value_field: String,
    /// When set, the record's `unit` field must equal it.
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,
}

mod defaults {
    pub fn value_field() -> String {
        "value".to_string()
    }

    pub fn timeout_secs() -> u64 {
        10
    }
}

fn field_matches(record: &Value, field: &str, expected: &str) -> bool {
    match record.get(field) {
        Some(Value::String(s)) => s == expected,
        Some(other) => other.to_string() == expected,
        None => false,
    }
}

/// Finds the first record matching every filter and returns its value.
pub fn extract_value(document: &Value, settings: &HttpJsonSettings) -> Result<f64, ModuleError> {
    let records = document
        .pointer(&settings.records_pointer)
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ModuleError::validation(format!("no array at {}", settings.records_pointer))
        })?;

    let record = records
        .iter()
        .find(|r| settings.filters.iter().all(|(k, v)| field_matches(r, k, v)))
        .ok_or_else(|| {
            ModuleError::validation(format!("no record matches {:?}", settings.filters))
        })?;

    if let Some(unit) = &settings.unit {
        if !field_matches(record, "unit", unit) {
            return Err(ModuleError::validation(format!(
                "unexpected unit {} (want {unit})",
                record.get("unit").unwrap_or(&Value::Null)
            )));
        }
    }

    record
        .get(&settings.value_field)
        .and_then(Value::as_f64)
        .ok_or_else(|| {
            ModuleError::validation(format!("record has no numeric {}", settings.value_field))
        })
}

pub struct HttpJson {
    settings: HttpJsonSettings,
    store: ReadingStore,
    client: reqwest::Client,
}

impl HttpJson {
    pub fn new(settings: HttpJsonSettings, store: ReadingStore) -> Result<Self, ModuleError> {
        if !settings.records_pointer.is_empty() && !settings.records_pointer.starts_with('/') {
            return Err(ModuleError::config(format!(
                "{KIND}: records_pointer must start with '/': {}",
                settings.records_pointer
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| ModuleError::config(format!("{KIND}: {e}")))?;
        Ok(Self {
            settings,
            store,
            client,
        })
    }

    async fn fetch(&self) -> Result<Value, TransportError> {
        let url = self.settings.url.as_str();
        self.client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| TransportError::new(url, "GET", e))?
            .json::<Value>()
            .await
            .map_err(|e| TransportError::new(url, "decode", e))
    }
}

#[async_trait]
impl Collection for HttpJson {
    fn name(&self) -> &str {
        KIND
    }

    async fn step(&mut self) -> Outcome {
        let result = match self.fetch().await {
            Ok(doc) => extract_value(&doc, &self.settings),
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(value) => {
                info!("{KIND}: {} reports {value}", self.settings.url);
                self.store.publish(value, &[]).into()
            }
            Err(e) => {
                debug!("{KIND}: reading attempt skipped: {e}");
                e.into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn settings() -> HttpJsonSettings {
        serde_json::from_value(json!({
            "url": "https://example.invalid/rhrread",
            "records_pointer": "/temperature/data",
            "filters": {"place": "Happy Valley"},
            "unit": "C",
        }))
        .unwrap()
    }

    fn document() -> Value {
        json!({
            "temperature": {
                "recordTime": "2024-06-01T10:00:00+08:00",
                "data": [
                    {"place": "King's Park", "value": 29, "unit": "C"},
                    {"place": "Happy Valley", "value": 30.5, "unit": "C"},
                ]
            }
        })
    }

    #[test]
    fn picks_record_by_filter() {
        assert_eq!(extract_value(&document(), &settings()).unwrap(), 30.5);
    }

    #[test]
    fn rejects_wrong_unit() {
        let mut doc = document();
        doc["temperature"]["data"][1]["unit"] = json!("F");
        let err = extract_value(&doc, &settings()).unwrap_err();
        assert!(err.to_string().contains("unit"));
    }

    #[test]
    fn missing_record_or_array_is_validation_error() {
        let mut s = settings();
        s.filters.insert("place".into(), "Nowhere".into());
        assert!(matches!(extract_value(&document(), &s), Err(ModuleError::Validation(_))));

        let mut s = settings();
        s.records_pointer = "/humidity/data".into();
        assert!(extract_value(&document(), &s).is_err());
    }

    #[test]
    fn non_numeric_value_is_rejected() {
        let mut doc = document();
        doc["temperature"]["data"][1]["value"] = json!("n/a");
        assert!(extract_value(&doc, &settings()).is_err());
    }

    #[test]
    fn relative_pointer_is_a_configuration_error() {
        let mut s = settings();
        s.records_pointer = "temperature/data".into();
        assert!(matches!(
            HttpJson::new(s, ReadingStore::new()),
            Err(ModuleError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_recoverable() {
        let mut s = settings();
        s.url = "http://127.0.0.1:9/".into();
        s.timeout_secs = 2;
        let store = ReadingStore::new();
        let mut source = HttpJson::new(s, store.clone()).unwrap();

        assert!(matches!(source.step().await, Outcome::Recoverable(ModuleError::Transport(_))));
        assert!(!store.snapshot().unwrap().valid);
    }
}
