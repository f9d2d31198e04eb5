//! Wire protocol for worker subprocess communication.
//!
//! Each direction carries framed messages (see [`crate::ipc`] for the
//! framing). An outbound frame decodes to a [`Request`] and an inbound frame
//! to a [`Response`]; the two are correlated by message id.

use crate::error::{PoolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a task should run on the worker side.
///
/// Closures do not survive serialization: the callable is encoded in
/// isolation and the worker sees none of the parent's environment. The
/// supported path is [`TaskTarget::Named`], resolved against the worker's
/// task registry; [`TaskTarget::Callable`] carries opaque bytes for embedders
/// that install their own callable decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TaskTarget {
    /// Name of a task registered on the worker side.
    Named(String),
    /// Opaque serialized callable, reconstructed by the worker-side runner.
    Callable(Vec<u8>),
}

impl TaskTarget {
    /// Reject targets that cannot possibly resolve.
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            Self::Named(name) if name.is_empty() => {
                Err(PoolError::InvalidArg("empty task name".into()))
            }
            Self::Callable(bytes) if bytes.is_empty() => {
                Err(PoolError::InvalidArg("empty serialized callable".into()))
            }
            _ => Ok(()),
        }
    }
}

impl From<&str> for TaskTarget {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for TaskTarget {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

impl std::fmt::Display for TaskTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named(name) => write!(f, "{}", name),
            Self::Callable(bytes) => write!(f, "<callable:{}B>", bytes.len()),
        }
    }
}

/// Request from parent to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Message id assigned at send time.
    pub id: u64,
    /// What to run.
    pub target: TaskTarget,
    /// Positional arguments, in order.
    pub args: Vec<Value>,
}

/// Whether a task ran to completion on the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Err,
}

/// Response from worker to parent.
///
/// On `Ok`, `body` is the task's return value (possibly a sequence). On
/// `Err`, `body` is a string carrying the remote error message and optional
/// trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Message id of the request this answers.
    pub id: u64,
    pub status: ResponseStatus,
    pub body: Value,
}

impl Response {
    /// Create a success response.
    pub fn ok(id: u64, body: Value) -> Self {
        Self {
            id,
            status: ResponseStatus::Ok,
            body,
        }
    }

    /// Create a failure response.
    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            status: ResponseStatus::Err,
            body: Value::String(message.into()),
        }
    }

    /// The remote error text, for `Err` responses.
    pub(crate) fn error_message(&self) -> String {
        match &self.body {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let req = Request {
            id: 7,
            target: TaskTarget::Named("double".into()),
            args: vec![json!(21)],
        };
        let bytes = serde_json::to_vec(&req).unwrap();
        let parsed: Request = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.target, TaskTarget::Named("double".into()));
        assert_eq!(parsed.args, vec![json!(21)]);
    }

    #[test]
    fn test_callable_target_round_trip() {
        let req = Request {
            id: 1,
            target: TaskTarget::Callable(vec![0xde, 0xad]),
            args: vec![],
        };
        let bytes = serde_json::to_vec(&req).unwrap();
        let parsed: Request = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.target, TaskTarget::Callable(vec![0xde, 0xad]));
    }

    #[test]
    fn test_response_ok_round_trip() {
        let resp = Response::ok(9, json!([1, 2, 3]));
        let bytes = serde_json::to_vec(&resp).unwrap();
        let parsed: Response = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.id, 9);
        assert_eq!(parsed.status, ResponseStatus::Ok);
        assert_eq!(parsed.body, json!([1, 2, 3]));
    }

    #[test]
    fn test_response_err_carries_message() {
        let resp = Response::err(3, "something went wrong");
        assert_eq!(resp.status, ResponseStatus::Err);
        assert_eq!(resp.error_message(), "something went wrong");

        let bytes = serde_json::to_vec(&resp).unwrap();
        let parsed: Response = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.error_message(), "something went wrong");
    }

    #[test]
    fn test_target_validation() {
        assert!(TaskTarget::Named("ok".into()).validate().is_ok());
        assert!(TaskTarget::Named(String::new()).validate().is_err());
        assert!(TaskTarget::Callable(vec![1]).validate().is_ok());
        assert!(TaskTarget::Callable(vec![]).validate().is_err());
    }

    #[test]
    fn test_target_from_str() {
        let target: TaskTarget = "sleep_ms".into();
        assert_eq!(target, TaskTarget::Named("sleep_ms".into()));
        assert_eq!(target.to_string(), "sleep_ms");
    }
}
