use std::{borrow::Cow, error, fmt, result};

/// Type alias for convenience when using the Result type with our error.
pub type FlowResult<T> = result::Result<T, FlowError>;

/// Internal error representation with kind, description, and optional
/// detail and source.
///
/// Boxed so the public error stays one pointer wide on the success path.
struct ErrorInner {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<String>,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

/// Error classification for flow orchestration.
///
/// The kinds mirror the seams of the orchestrator: catalog access, child
/// workflows, long-running activities, and the control surface. The sync
/// backoff classifier dispatches on these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The flow connection configs are missing or malformed.
    InvalidFlowConfig,
    /// The orchestrator observed a state it cannot act from.
    InvalidState,

    /// Catalog read failure.
    CatalogReadFailed,
    /// Catalog write failure.
    CatalogWriteFailed,

    /// The setup child workflow failed.
    SetupFlowFailed,
    /// The snapshot child workflow failed.
    SnapshotFlowFailed,
    /// The drop child workflow failed.
    DropFlowFailed,
    /// A child workflow task panicked.
    ChildFlowPanicked,

    /// Altering the source publication failed.
    PublicationAlterFailed,
    /// Purging staged rows for removed tables failed.
    RawTableCleanupFailed,
    /// Removing table mappings from the catalog failed.
    CatalogCleanupFailed,
    /// The shadow-table rename failed.
    RenameTablesFailed,

    /// The sync activity returned an application error.
    SyncFlowFailed,
    /// The source reported SQLSTATE 55006: the replication object is in use.
    SourceObjectInUse,
    /// The sync activity task panicked.
    SyncFlowPanicked,

    /// An activity exceeded its execution bound.
    ActivityTimeout,
    /// The workflow was cancelled.
    FlowCancelled,

    /// Aggregation of several errors.
    Many,
    /// Error that doesn't fit other categories.
    Unknown,
}

impl ErrorKind {
    /// Returns `true` for errors raised by activity or workflow code, as
    /// opposed to infrastructure failures (timeouts, panics, cancellation).
    pub fn is_application(&self) -> bool {
        !matches!(
            self,
            ErrorKind::ActivityTimeout
                | ErrorKind::SyncFlowPanicked
                | ErrorKind::ChildFlowPanicked
                | ErrorKind::FlowCancelled
                | ErrorKind::Unknown
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidFlowConfig => "invalid_flow_config",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::CatalogReadFailed => "catalog_read_failed",
            ErrorKind::CatalogWriteFailed => "catalog_write_failed",
            ErrorKind::SetupFlowFailed => "setup_flow_failed",
            ErrorKind::SnapshotFlowFailed => "snapshot_flow_failed",
            ErrorKind::DropFlowFailed => "drop_flow_failed",
            ErrorKind::ChildFlowPanicked => "child_flow_panicked",
            ErrorKind::PublicationAlterFailed => "publication_alter_failed",
            ErrorKind::RawTableCleanupFailed => "raw_table_cleanup_failed",
            ErrorKind::CatalogCleanupFailed => "catalog_cleanup_failed",
            ErrorKind::RenameTablesFailed => "rename_tables_failed",
            ErrorKind::SyncFlowFailed => "sync_flow_failed",
            ErrorKind::SourceObjectInUse => "source_object_in_use",
            ErrorKind::SyncFlowPanicked => "sync_flow_panicked",
            ErrorKind::ActivityTimeout => "activity_timeout",
            ErrorKind::FlowCancelled => "flow_cancelled",
            ErrorKind::Many => "many",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Collection of errors gathered from parallel workers.
pub struct Errors(Vec<FlowError>);

impl From<Vec<FlowError>> for Errors {
    fn from(value: Vec<FlowError>) -> Self {
        Errors(value)
    }
}

impl fmt::Debug for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Errors")
            .field("count", &self.0.len())
            .field("errors", &self.0)
            .finish()
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "{}", self.0[0]),
            count => {
                write!(f, "{count} errors: ")?;
                for (i, error) in self.0.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{error}")?;
                }
                Ok(())
            }
        }
    }
}

impl error::Error for Errors {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        // We can only surface one source, use the first.
        self.0.first().and_then(|err| error::Error::source(err))
    }
}

/// A stable error type for flow orchestration.
///
/// Carries an [`ErrorKind`], a static description, an optional dynamic
/// detail string, and an optional source error. Constructed through the
/// [`crate::flow_error!`] and [`crate::bail!`] macros.
pub struct FlowError(Box<ErrorInner>);

impl FlowError {
    /// Creates a new error with the given kind and description.
    pub fn new(kind: ErrorKind, description: impl Into<Cow<'static, str>>) -> Self {
        FlowError(Box::new(ErrorInner {
            kind,
            description: description.into(),
            detail: None,
            source: None,
        }))
    }

    /// Attaches a dynamic detail string to the error.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.0.detail = Some(detail.into());
        self
    }

    /// Attaches a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        self.0.source = Some(source.into());
        self
    }

    /// Aggregates several errors into a single [`ErrorKind::Many`] error.
    pub fn from_many(errors: impl Into<Errors>) -> Self {
        let errors = errors.into();
        FlowError::new(ErrorKind::Many, format!("{} workers failed", errors.0.len()))
            .with_source(errors)
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    /// Returns `true` for errors raised by activity or workflow code.
    pub fn is_application(&self) -> bool {
        self.0.kind.is_application()
    }

    /// Returns `true` when the error carries the given SQLSTATE.
    ///
    /// Classification is primarily typed ([`ErrorKind::SourceObjectInUse`]),
    /// but errors that crossed a serialization boundary only retain the
    /// SQLSTATE in their rendered message, so the text is checked too.
    pub fn contains_sqlstate(&self, sqlstate: &str) -> bool {
        let needle = format!("(SQLSTATE {sqlstate})");
        self.to_string().contains(&needle)
    }
}

impl fmt::Debug for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowError")
            .field("kind", &self.0.kind)
            .field("description", &self.0.description)
            .field("detail", &self.0.detail)
            .field("source", &self.0.source)
            .finish()
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.description)?;
        if let Some(detail) = &self.0.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl error::Error for FlowError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0
            .source
            .as_deref()
            .map(|source| source as &(dyn error::Error + 'static))
    }
}

impl From<(ErrorKind, &'static str)> for FlowError {
    fn from((kind, description): (ErrorKind, &'static str)) -> Self {
        FlowError::new(kind, description)
    }
}

impl From<(ErrorKind, &'static str, String)> for FlowError {
    fn from((kind, description, detail): (ErrorKind, &'static str, String)) -> Self {
        FlowError::new(kind, description).with_detail(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = FlowError::new(ErrorKind::SyncFlowFailed, "sync flow failed")
            .with_detail("connection refused");
        assert_eq!(err.to_string(), "sync flow failed: connection refused");
    }

    #[test]
    fn sqlstate_detected_in_rendered_message() {
        let err = FlowError::new(ErrorKind::SyncFlowFailed, "sync flow failed")
            .with_detail("cannot drop replication slot (SQLSTATE 55006)");
        assert!(err.contains_sqlstate("55006"));
        assert!(!err.contains_sqlstate("42P01"));
    }

    #[test]
    fn infrastructure_kinds_are_not_application_errors() {
        assert!(!ErrorKind::SyncFlowPanicked.is_application());
        assert!(!ErrorKind::ActivityTimeout.is_application());
        assert!(!ErrorKind::FlowCancelled.is_application());
        assert!(ErrorKind::SyncFlowFailed.is_application());
        assert!(ErrorKind::SourceObjectInUse.is_application());
    }

    #[test]
    fn many_aggregates_and_keeps_first_source() {
        let errors = vec![
            FlowError::new(ErrorKind::SyncFlowFailed, "first"),
            FlowError::new(ErrorKind::SetupFlowFailed, "second"),
        ];
        let aggregated = FlowError::from_many(errors);
        assert_eq!(aggregated.kind(), ErrorKind::Many);
        assert!(std::error::Error::source(&aggregated).is_some());
    }
}
