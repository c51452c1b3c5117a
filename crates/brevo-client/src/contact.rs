//! Brevo contact model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_update_enabled() -> bool {
    true
}

/// A contact to create or update in Brevo.
///
/// The serde form is what producers store in outbox payloads; extra keys
/// such as `funnel_type` or `purchased_at` are ignored when decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrevoContact {
    pub email: String,
    #[serde(default)]
    pub list_ids: Vec<i64>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default = "default_update_enabled")]
    pub update_enabled: bool,
}

impl BrevoContact {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            list_ids: Vec::new(),
            attributes: Map::new(),
            update_enabled: true,
        }
    }

    pub fn with_list(mut self, list_id: i64) -> Self {
        self.list_ids.push(list_id);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Request body for `POST /contacts`.
    ///
    /// Empty list ids and attributes are left out.
    pub fn to_payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("email".to_string(), Value::String(self.email.clone()));
        payload.insert("updateEnabled".to_string(), Value::Bool(self.update_enabled));
        if !self.list_ids.is_empty() {
            payload.insert(
                "listIds".to_string(),
                Value::Array(self.list_ids.iter().map(|id| Value::from(*id)).collect()),
            );
        }
        if !self.attributes.is_empty() {
            payload.insert("attributes".to_string(), Value::Object(self.attributes.clone()));
        }
        Value::Object(payload)
    }
}
