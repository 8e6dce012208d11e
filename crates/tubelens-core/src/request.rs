//! Analysis request payload

use serde::Serialize;
use serde_json::Value;

/// Caller-supplied JSON body sent unchanged to the streaming and fallback endpoints
///
/// The consumer never inspects it; a session takes ownership so the body
/// cannot change once the request is in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AnalysisRequest {
    body: Value,
}

impl AnalysisRequest {
    /// Build from any serializable payload
    pub fn new<T: Serialize>(payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            body: serde_json::to_value(payload)?,
        })
    }

    pub fn from_value(body: Value) -> Self {
        Self { body }
    }

    /// Set a top-level field; a non-object body is wrapped as `{"data": body}` first
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        if !self.body.is_object() {
            let data = std::mem::take(&mut self.body);
            self.body = serde_json::json!({ "data": data });
        }
        if let Value::Object(map) = &mut self.body {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn body(&self) -> &Value {
        &self.body
    }
}
