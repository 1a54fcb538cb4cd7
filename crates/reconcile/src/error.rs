use lso_core::StoreError;
use lso_render::RenderError;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The resource itself is wrong; retrying cannot help until its spec changes.
    #[error("configuration: {0}")]
    Permanent(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("render: {0}")]
    Render(#[from] RenderError),
    /// The store has not assigned a uid yet, so no owner reference can be built.
    #[error("{0} has no uid yet")]
    MissingUid(String),
    #[error("propagation incomplete: {failed} of {total} generation bumps failed (last: {last})")]
    Propagation { failed: usize, total: usize, last: StoreError },
}

impl ReconcileError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ReconcileError::Permanent(_) | ReconcileError::Render(_))
    }

    /// Whether the re-invocation mechanism should retry with backoff.
    pub fn is_retryable(&self) -> bool { !self.is_permanent() }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcileError::Permanent(_) => "permanent",
            ReconcileError::Store(e) if e.is_conflict() => "conflict",
            ReconcileError::Store(_) => "store",
            ReconcileError::Render(_) => "render",
            ReconcileError::MissingUid(_) => "missing_uid",
            ReconcileError::Propagation { .. } => "propagation",
        }
    }
}
