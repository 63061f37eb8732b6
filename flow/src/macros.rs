//! Utility macros for error handling.

/// Creates a [`crate::error::FlowError`] from an error kind and description,
/// with an optional detail value.
///
/// # Examples
/// ```rust,no_run
/// use flow::error::{ErrorKind, FlowError};
/// use flow::flow_error;
///
/// let error = flow_error!(ErrorKind::InvalidState, "flow is not running");
/// let error = flow_error!(
///     ErrorKind::CatalogWriteFailed,
///     "failed to persist flow status",
///     format!("flow {}", "mirror_a")
/// );
/// ```
#[macro_export]
macro_rules! flow_error {
    ($kind:expr, $desc:expr) => {
        FlowError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        FlowError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Creates and returns a [`crate::error::FlowError`] from the current
/// function.
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return Err($crate::flow_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return Err($crate::flow_error!($kind, $desc, $detail))
    };
}
