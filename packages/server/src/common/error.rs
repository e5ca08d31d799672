//! Error taxonomy for the orchestration core.
//!
//! Every caller-facing operation returns [`CoreError`], a closed enum with a
//! stable machine-readable kind code plus a human-readable message. The admin
//! layer maps kinds to its own wire format; the core never formats HTML or
//! chooses HTTP statuses.

use thiserror::Error;

use crate::store::StoreError;

/// Result alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Closed error enum for the orchestration core.
///
/// Validation errors leave no state behind. Transient errors may be retried
/// by the caller. `ConfigStore` and `PluginLoadFailed` are fatal: the server
/// halts rather than running with a store it cannot trust.
#[derive(Debug, Error)]
pub enum CoreError {
    // Validation (caller-visible, no state change)
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("unknown job class: {0}")]
    UnknownJobClass(String),

    #[error("unknown optimization algorithm: {0}")]
    UnknownOptimizationAlgorithm(String),

    #[error("invalid dependency: {0}")]
    InvalidDependency(String),

    #[error("requested client unavailable: {0}")]
    RequestedClientUnavailable(String),

    #[error("duplicate client: {0}")]
    DuplicateClient(String),

    #[error("unknown folder: {0}")]
    UnknownFolder(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not cancellable: {0}")]
    NotCancellable(String),

    #[error("not pausable: {0}")]
    NotPausable(String),

    // Transient runtime
    #[error("client manager busy: {0}")]
    ManagerBusy(String),

    #[error("client manager unreachable: {0}")]
    ManagerUnreachable(String),

    #[error("capacity exceeded on manager {manager}: requested {requested}, headroom {headroom}")]
    CapacityExceeded {
        manager: String,
        requested: u32,
        headroom: u32,
    },

    #[error("insufficient idle clients: need {needed}, have {available}")]
    InsufficientClients { needed: usize, available: usize },

    // Terminal runtime (the affected job ends in StoppedDueToError)
    #[error("client disconnected during run: {0}")]
    ClientDisconnected(String),

    #[error("dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("statistics unreadable: {0}")]
    StatisticsUnreadable(String),

    // Fatal system
    #[error("config store error: {0}")]
    ConfigStore(#[from] StoreError),

    #[error("plugin load failed: {0}")]
    PluginLoadFailed(String),
}

impl CoreError {
    /// Stable kind code for programmatic matching across the admin boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidValue(_) => "invalid_value",
            CoreError::UnknownJobClass(_) => "unknown_job_class",
            CoreError::UnknownOptimizationAlgorithm(_) => "unknown_optimization_algorithm",
            CoreError::InvalidDependency(_) => "invalid_dependency",
            CoreError::RequestedClientUnavailable(_) => "requested_client_unavailable",
            CoreError::DuplicateClient(_) => "duplicate_client",
            CoreError::UnknownFolder(_) => "unknown_folder",
            CoreError::NotFound(_) => "not_found",
            CoreError::NotCancellable(_) => "not_cancellable",
            CoreError::NotPausable(_) => "not_pausable",
            CoreError::ManagerBusy(_) => "manager_busy",
            CoreError::ManagerUnreachable(_) => "manager_unreachable",
            CoreError::CapacityExceeded { .. } => "capacity_exceeded",
            CoreError::InsufficientClients { .. } => "insufficient_clients",
            CoreError::ClientDisconnected(_) => "client_disconnected",
            CoreError::DispatchFailed(_) => "dispatch_failed",
            CoreError::StatisticsUnreadable(_) => "statistics_unreadable",
            CoreError::ConfigStore(_) => "config_store",
            CoreError::PluginLoadFailed(_) => "plugin_load_failed",
        }
    }

    /// Whether the error is fatal to the server as a whole.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::ConfigStore(_) | CoreError::PluginLoadFailed(_)
        )
    }
}
