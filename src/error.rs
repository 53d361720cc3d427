//! Error types for Phoenix.

use uuid::Uuid;

use crate::model::{ExperimentState, TaskStatus};

/// Coarse classification of every error the control plane can surface.
///
/// Handlers map kinds to HTTP status codes; retry loops treat `Transient`
/// as retriable and `Cancelled` as a short-circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Unauthenticated,
    PermissionDenied,
    NotOwner,
    Transient,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Stable wire name, used in API error bodies.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied => "permission-denied",
            Self::NotOwner => "not-owner",
            Self::Transient => "transient",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

/// Top-level error type for the control plane.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Hub error: {0}")]
    Hub(#[from] HubError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Validation,
            Self::Store(e) => e.kind(),
            Self::Bus(e) => e.kind(),
            Self::Queue(e) => e.kind(),
            Self::Dispatch(e) => e.kind(),
            Self::Engine(e) => e.kind(),
            Self::Hub(e) => e.kind(),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Store-related errors.
///
/// Callers distinguish three families: `NotFound`, `Conflict` (lost
/// compare-and-set or uniqueness violation) and everything transient;
/// the rest is a programmer or operator problem.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database cannot be reached right now; retrying may help.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("no {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("schema migration did not complete: {0}")]
    Migration(String),

    /// A row or payload would not encode/decode.
    #[error("bad stored value: {0}")]
    Codec(String),

    /// A statement the store itself issued misbehaved.
    #[error("statement failed: {0}")]
    Statement(String),

    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error("pool setup failed: {0}")]
    PoolBuild(#[from] deadpool_postgres::BuildError),

    #[error("connection checkout failed: {0}")]
    Checkout(#[from] deadpool_postgres::PoolError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Unavailable(_) | Self::Checkout(_) | Self::Postgres(_) => ErrorKind::Transient,
            Self::Statement(_) | Self::Migration(_) | Self::Codec(_) | Self::PoolBuild(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Conflict helper for unique-constraint violations.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

/// Event bus errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("Subscription {0} not found")]
    UnknownSubscription(Uuid),
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Closed => ErrorKind::Conflict,
            Self::UnknownSubscription(_) => ErrorKind::NotFound,
        }
    }
}

/// Task queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("Host {host_id} does not hold the lease on task {task_id}")]
    NotOwner { task_id: Uuid, host_id: String },

    #[error("Task {id} cannot go from {from} to {to}")]
    IllegalTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Invalid task: {reason}")]
    Invalid { reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TaskNotFound { .. } => ErrorKind::NotFound,
            Self::NotOwner { .. } => ErrorKind::NotOwner,
            Self::IllegalTransition { .. } => ErrorKind::Conflict,
            Self::Invalid { .. } => ErrorKind::Validation,
            Self::Store(e) => e.kind(),
            Self::Bus(e) => e.kind(),
        }
    }
}

/// Agent dispatcher errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown host: {host_id}")]
    UnknownHost { host_id: String },

    #[error("Poll cancelled for host {host_id}")]
    Cancelled { host_id: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownHost { .. } => ErrorKind::Unauthenticated,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Store(e) => e.kind(),
            Self::Queue(e) => e.kind(),
        }
    }
}

/// Experiment engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Experiment {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid experiment: {}", join_validation_errors(.0))]
    Validation(Vec<crate::model::ValidationError>),

    #[error("Experiment {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: ExperimentState,
        to: ExperimentState,
    },

    #[error("experiment not completed")]
    NotCompleted { id: Uuid },

    #[error("Experiment {id} was not recommended for promotion ({recommendation})")]
    NotPromotable { id: Uuid, recommendation: String },

    #[error("Failed to render pipeline config {template}: {reason}")]
    Render { template: String, reason: String },

    #[error("Metric source query failed: {0}")]
    MetricSource(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

fn join_validation_errors(errors: &[crate::model::ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidTransition { .. } | Self::NotCompleted { .. } | Self::NotPromotable { .. } => {
                ErrorKind::Conflict
            }
            Self::Render { .. } => ErrorKind::Internal,
            Self::MetricSource(_) => ErrorKind::Transient,
            Self::Store(e) => e.kind(),
            Self::Queue(e) => e.kind(),
            Self::Bus(e) => e.kind(),
        }
    }
}

/// Realtime hub errors.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Client {0} disconnected")]
    Disconnected(Uuid),

    #[error("Client {0} closed as slow consumer")]
    SlowConsumer(Uuid),

    #[error("Invalid client message: {0}")]
    InvalidMessage(String),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

impl HubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Disconnected(_) | Self::SlowConsumer(_) => ErrorKind::Transient,
            Self::InvalidMessage(_) => ErrorKind::Validation,
            Self::Bus(e) => e.kind(),
        }
    }
}

/// Result type alias for the control plane.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display() {
        let err = StoreError::NotFound {
            entity: "experiment",
            id: "abc-123".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("experiment"), "Should mention entity: {msg}");
        assert!(msg.contains("abc-123"), "Should mention id: {msg}");

        let err = StoreError::Statement("syntax error near SELECT".to_string());
        assert!(err.to_string().contains("syntax error"));
    }

    #[test]
    fn queue_error_kinds() {
        let id = Uuid::new_v4();
        let err = QueueError::NotOwner {
            task_id: id,
            host_id: "h1".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::NotOwner);
        assert!(err.to_string().contains("h1"));

        let err = QueueError::IllegalTransition {
            id,
            from: TaskStatus::Completed,
            to: TaskStatus::Running,
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn dispatch_unknown_host_is_unauthenticated() {
        let err = DispatchError::UnknownHost {
            host_id: "ghost".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);
    }

    #[test]
    fn promotion_conflict_message() {
        let err = EngineError::NotCompleted { id: Uuid::new_v4() };
        assert_eq!(err.to_string(), "experiment not completed");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn transient_kinds_propagate_through_wrappers() {
        let store = StoreError::Unavailable("pool exhausted".to_string());
        assert_eq!(store.kind(), ErrorKind::Transient);

        let queue: QueueError = store.into();
        assert_eq!(queue.kind(), ErrorKind::Transient);

        let dispatch: DispatchError = queue.into();
        assert_eq!(dispatch.kind(), ErrorKind::Transient);
    }

    #[test]
    fn top_level_error_from_conversions() {
        let config_err = ConfigError::InvalidValue {
            key: "PHOENIX_LISTEN".to_string(),
            message: "not a socket address".to_string(),
        };
        let err: Error = config_err.into();
        assert!(matches!(err, Error::Config(_)));

        let bus_err = BusError::Closed;
        let err: Error = bus_err.into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn kind_wire_names() {
        assert_eq!(ErrorKind::NotOwner.as_str(), "not-owner");
        assert_eq!(ErrorKind::Unauthenticated.as_str(), "unauthenticated");
        assert_eq!(ErrorKind::Internal.as_str(), "internal");
    }
}
