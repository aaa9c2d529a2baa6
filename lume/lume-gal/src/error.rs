//! Error taxonomy shared by every layer of the crate.
//!
//! All failures are raised synchronously at the call that detects them and are
//! never retried internally. Teardown paths do not produce errors at all.

/// Error returned by fallible operations on the graphics layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum GalError {
    /// The backend ran out of device or host memory.
    #[error("allocation of {size} bytes for {what} failed: out of memory")]
    AllocationFailure { what: String, size: u64 },
    /// A usage flag combination that the active backend cannot represent.
    #[error("unsupported usage: {0}")]
    UnsupportedUsage(String),
    /// A feature that the active device does not expose (e.g. ray query).
    #[error("unsupported capability: {0}")]
    UnsupportedCapability(String),
    /// A resource set or bind call whose shape does not match its layout.
    #[error("binding mismatch: {0}")]
    BindingMismatch(String),
    /// An acceleration structure build with no geometry or no instances.
    #[error("empty build input: {0}")]
    EmptyBuildInput(&'static str),
    /// The backend rejected or failed an acceleration structure build.
    #[error("acceleration structure build failed: {0}")]
    BuildFailure(String),
    /// A graphics pipeline bound against a framebuffer it cannot render into.
    #[error("pipeline outputs {pipeline} do not match framebuffer {framebuffer}")]
    PipelineOutputMismatch { pipeline: String, framebuffer: String },
    /// An object used out of its lifecycle order.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// A descriptor that violates its own invariants.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    /// The native device was lost; the context must be recreated.
    #[error("device lost")]
    DeviceLost,
    /// Any other native API failure.
    #[error("backend error: {0}")]
    Backend(String),
}

pub type GalResult<T> = Result<T, GalError>;

impl GalError {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        GalError::InvalidState(msg.into())
    }

    pub(crate) fn binding(msg: impl Into<String>) -> Self {
        GalError::BindingMismatch(msg.into())
    }

    pub(crate) fn descriptor(msg: impl Into<String>) -> Self {
        GalError::InvalidDescriptor(msg.into())
    }

    pub(crate) fn oom(what: impl Into<String>, size: u64) -> Self {
        GalError::AllocationFailure { what: what.into(), size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_details() {
        let err = GalError::oom("vertex buffer", 48);
        assert_eq!(
            err.to_string(),
            "allocation of 48 bytes for vertex buffer failed: out of memory"
        );

        let err = GalError::PipelineOutputMismatch {
            pipeline: "[Rgba8Unorm] x1".into(),
            framebuffer: "[Bgra8Unorm] x1".into(),
        };
        assert!(err.to_string().contains("Rgba8Unorm"));
        assert!(err.to_string().contains("Bgra8Unorm"));
    }

    #[test]
    fn empty_build_input_names_the_list() {
        let err = GalError::EmptyBuildInput("instances");
        assert_eq!(err.to_string(), "empty build input: instances");
    }
}
