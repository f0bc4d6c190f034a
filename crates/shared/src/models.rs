//! Domain models exchanged with the budget backend.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Action name carried by the metadata of a framed attachment upload.
pub const CREATE_EXPENSE_ACTION: &str = "create_expense";

/// Access/refresh token pair issued by `POST /api/token/refresh/`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// Aggregates the server recomputes after an expense changes.
///
/// The backend serializes decimals either as JSON numbers or as strings and
/// ids as numbers or strings, so every field is decoded leniently: a value of
/// an unexpected shape leaves its typed field `None` instead of failing the
/// whole message. Fields the client does not know about are kept in `extra`,
/// and an update read off the socket carries the object exactly as it arrived
/// in `raw`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ExpenseUpdate {
    #[serde(default, deserialize_with = "lenient::id", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::amount", skip_serializing_if = "Option::is_none")]
    pub total_expenses: Option<f64>,
    #[serde(default, deserialize_with = "lenient::amount", skip_serializing_if = "Option::is_none")]
    pub budget_gap: Option<f64>,

    #[serde(default, deserialize_with = "lenient::id", skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::amount", skip_serializing_if = "Option::is_none")]
    pub activity_estimated: Option<f64>,
    #[serde(default, deserialize_with = "lenient::amount", skip_serializing_if = "Option::is_none")]
    pub activity_spent: Option<f64>,
    #[serde(default, deserialize_with = "lenient::amount", skip_serializing_if = "Option::is_none")]
    pub activity_gap: Option<f64>,

    #[serde(default, deserialize_with = "lenient::id", skip_serializing_if = "Option::is_none")]
    pub subactivity_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::amount", skip_serializing_if = "Option::is_none")]
    pub subactivity_estimated: Option<f64>,
    #[serde(default, deserialize_with = "lenient::amount", skip_serializing_if = "Option::is_none")]
    pub subactivity_spent: Option<f64>,
    #[serde(default, deserialize_with = "lenient::amount", skip_serializing_if = "Option::is_none")]
    pub subactivity_gap: Option<f64>,

    /// Where the uploaded proof of payment can be downloaded.
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub proof_of_payment_url: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,

    /// The received JSON object, unmodified. Empty for updates built locally.
    #[serde(skip)]
    pub raw: Map<String, Value>,
}

/// Commands the client sends over the project socket.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ExpenseCommand {
    UpdateExpense {
        subactivity_id: i64,
        amount_spent: f64,
        name: String,
    },
    DeleteExpense {
        expense_id: i64,
    },
}

/// JSON metadata that precedes the file bytes of a framed upload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UploadMetadata {
    pub action: String,
    pub subactivity_id: i64,
    pub amount_spent: f64,
    pub name: String,
}

impl UploadMetadata {
    /// Metadata for a new expense with an attached proof of payment.
    pub fn new(subactivity_id: i64, amount_spent: f64, name: impl Into<String>) -> Self {
        Self {
            action: CREATE_EXPENSE_ACTION.to_string(),
            subactivity_id,
            amount_spent,
            name: name.into(),
        }
    }
}

mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
    }

    pub fn id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::String(s)) => Some(s),
            _ => None,
        })
    }

    pub fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            Some(Value::String(s)) => Some(s),
            _ => None,
        })
    }
}
