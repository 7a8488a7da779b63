// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tether-core.
//!
//! Provides a unified error type with stable error codes. Errors raised while
//! dispatching a callable are turned into `{success: false, error}` frames
//! using their `Display` text.

use std::fmt;

use tether_protocol::{READONLY_ERROR, RpcResponse};

/// Core errors that can occur while operating an agent instance.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// A readonly connection attempted to mutate state.
    ReadonlyViolation {
        /// The connection that was rejected.
        connection_id: String,
    },

    /// The agent's state validation hook rejected the new state.
    ValidationRejected {
        /// The message returned by the hook.
        message: String,
    },

    /// No method with this name is registered on the agent.
    MethodNotFound {
        /// The requested method name.
        method: String,
    },

    /// The method exists but is not marked callable.
    NotCallable {
        /// The requested method name.
        method: String,
    },

    /// A schedule named a callback that the agent does not define.
    UnknownCallback {
        /// The callback name.
        callback: String,
    },

    /// A schedule could not be created (bad cron expression, bad delay).
    InvalidSchedule {
        /// The reason the schedule was rejected.
        reason: String,
    },

    /// A workflow with this id is already tracked by the instance.
    DuplicateWorkflowId {
        /// The duplicate workflow id.
        workflow_id: String,
    },

    /// The workflow engine does not know this binding.
    BindingNotFound {
        /// The binding name.
        binding: String,
    },

    /// No tracking row exists for this workflow id.
    WorkflowNotFound {
        /// The workflow id.
        workflow_id: String,
    },

    /// The external workflow engine returned an error.
    WorkflowEngine {
        /// Error details.
        details: String,
    },

    /// Persisted state could not be parsed.
    CorruptedState {
        /// Parse error details.
        details: String,
    },

    /// A job's running flag outlived the staleness threshold.
    StaleJobLock {
        /// The schedule id.
        schedule_id: String,
    },

    /// No agent type is registered under this name.
    UnknownAgent {
        /// The requested agent type.
        agent: String,
    },

    /// An instance name that cannot be used as a storage key.
    InvalidInstanceName {
        /// The rejected name.
        name: String,
    },

    /// The instance actor has shut down.
    InstanceClosed {
        /// The instance name.
        name: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ReadonlyViolation { .. } => "READONLY_VIOLATION",
            Self::ValidationRejected { .. } => "VALIDATION_REJECTED",
            Self::MethodNotFound { .. } => "METHOD_NOT_FOUND",
            Self::NotCallable { .. } => "NOT_CALLABLE",
            Self::UnknownCallback { .. } => "UNKNOWN_CALLBACK",
            Self::InvalidSchedule { .. } => "INVALID_SCHEDULE",
            Self::DuplicateWorkflowId { .. } => "DUPLICATE_WORKFLOW_ID",
            Self::BindingNotFound { .. } => "BINDING_NOT_FOUND",
            Self::WorkflowNotFound { .. } => "WORKFLOW_NOT_FOUND",
            Self::WorkflowEngine { .. } => "WORKFLOW_ENGINE_ERROR",
            Self::CorruptedState { .. } => "CORRUPTED_STATE",
            Self::StaleJobLock { .. } => "STALE_JOB_LOCK",
            Self::UnknownAgent { .. } => "UNKNOWN_AGENT",
            Self::InvalidInstanceName { .. } => "INVALID_INSTANCE_NAME",
            Self::InstanceClosed { .. } => "INSTANCE_CLOSED",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Convert this error to a terminal RPC error response.
    pub fn to_rpc_response(&self, request_id: &str) -> RpcResponse {
        RpcResponse::error(request_id, self.to_string())
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadonlyViolation { .. } => f.write_str(READONLY_ERROR),
            Self::ValidationRejected { message } => {
                write!(f, "State validation failed: {}", message)
            }
            Self::MethodNotFound { method } => {
                write!(f, "Method {} does not exist", method)
            }
            Self::NotCallable { method } => write!(f, "Method {} is not callable", method),
            Self::UnknownCallback { callback } => {
                write!(f, "Callback '{}' is not a method of this agent", callback)
            }
            Self::InvalidSchedule { reason } => write!(f, "Invalid schedule: {}", reason),
            Self::DuplicateWorkflowId { workflow_id } => {
                write!(
                    f,
                    "Workflow '{}' is already being tracked by this instance",
                    workflow_id
                )
            }
            Self::BindingNotFound { binding } => {
                write!(f, "Workflow binding '{}' not found", binding)
            }
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "Workflow '{}' not found", workflow_id)
            }
            Self::WorkflowEngine { details } => write!(f, "Workflow engine error: {}", details),
            Self::CorruptedState { details } => {
                write!(f, "Persisted state is corrupted: {}", details)
            }
            Self::StaleJobLock { schedule_id } => {
                write!(f, "Schedule '{}' has a stale running flag", schedule_id)
            }
            Self::UnknownAgent { agent } => write!(f, "Unknown agent type '{}'", agent),
            Self::InvalidInstanceName { name } => {
                write!(f, "Invalid instance name '{}'", name)
            }
            Self::InstanceClosed { name } => write!(f, "Instance '{}' is closed", name),
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_codes() {
        let test_cases = vec![
            (
                CoreError::ReadonlyViolation {
                    connection_id: "c1".to_string(),
                },
                "READONLY_VIOLATION",
            ),
            (
                CoreError::ValidationRejected {
                    message: "negative".to_string(),
                },
                "VALIDATION_REJECTED",
            ),
            (
                CoreError::MethodNotFound {
                    method: "nope".to_string(),
                },
                "METHOD_NOT_FOUND",
            ),
            (
                CoreError::NotCallable {
                    method: "helper".to_string(),
                },
                "NOT_CALLABLE",
            ),
            (
                CoreError::DuplicateWorkflowId {
                    workflow_id: "wf-1".to_string(),
                },
                "DUPLICATE_WORKFLOW_ID",
            ),
            (
                CoreError::BindingNotFound {
                    binding: "MISSING".to_string(),
                },
                "BINDING_NOT_FOUND",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "disk full".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_core_error_display() {
        let err = CoreError::ReadonlyViolation {
            connection_id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "Connection is readonly");

        let err = CoreError::MethodNotFound {
            method: "fly".to_string(),
        };
        assert_eq!(err.to_string(), "Method fly does not exist");

        let err = CoreError::NotCallable {
            method: "secret".to_string(),
        };
        assert_eq!(err.to_string(), "Method secret is not callable");

        let err = CoreError::DuplicateWorkflowId {
            workflow_id: "wf-9".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Workflow 'wf-9' is already being tracked by this instance"
        );
    }

    #[test]
    fn test_to_rpc_response() {
        let resp = CoreError::ReadonlyViolation {
            connection_id: "abc".to_string(),
        }
        .to_rpc_response("req-1");

        assert_eq!(resp.id, "req-1");
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("Connection is readonly"));
    }
}
