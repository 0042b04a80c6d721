//! Request and response payload conventions.
//!
//! Every request is a JSON object with an `action` naming the operation plus
//! operation-specific fields. Every response carries a boolean `success` and,
//! when it failed, a `message` and/or `error` string. The transport itself
//! never looks inside payloads; these types are for the application side.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An outgoing request.
///
/// ```
/// use storelink::models::Request;
///
/// let login = Request::new("login")
///     .with("username", "alice")
///     .with("password", "secret");
/// let json = serde_json::to_value(&login).unwrap();
/// assert_eq!(json["action"], "login");
/// assert_eq!(json["username"], "alice");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub action: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Request {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            fields: Map::new(),
        }
    }

    /// Add an operation-specific field. A field named `action` is ignored.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "action" {
            self.fields.insert(key, value.into());
        }
        self
    }
}

/// A server response.
///
/// Fields other than `success`, `message` and `error` are kept in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Response {
    /// A failed response built on the client side.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            error: None,
            data: Map::new(),
        }
    }

    /// Interpret a decoded reply.
    ///
    /// A reply that is not an object or lacks a boolean `success` becomes a
    /// failure describing the problem.
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value(value) {
            Ok(response) => response,
            Err(e) => Self::failure(format!("Malformed response: {}", e)),
        }
    }

    /// The human-readable failure text, preferring `message` over `error`.
    pub fn error_message(&self) -> Option<&str> {
        self.message.as_deref().or(self.error.as_deref())
    }

    /// Typed access to a payload field.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Convert to a Result: the payload fields on success, the failure text
    /// otherwise.
    pub fn into_result(self) -> Result<Map<String, Value>, String> {
        if self.success {
            Ok(self.data)
        } else {
            Err(self
                .message
                .or(self.error)
                .unwrap_or_else(|| "Request failed".to_string()))
        }
    }
}
