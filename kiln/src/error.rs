use std::path::PathBuf;
use thiserror::Error;

/// How far an error propagates before rendering can continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Scene load or device setup cannot complete, the renderer is unusable.
    SetupFatal,
    /// The current render call is aborted.
    FrameFatal,
    /// Logged and replaced with a placeholder, rendering continues.
    Degraded,
}

#[derive(Error, Debug)]
pub enum Error {
    /// No usable device or required extension
    #[error("device creation failed: {0}")]
    DeviceCreation(String),

    /// Allocation of device memory failed
    #[error("out of memory allocating {size} bytes for {what}")]
    OutOfMemory { what: &'static str, size: usize },

    /// Acceleration structure build, query or compaction failed
    #[error("acceleration structure build failed: {0}")]
    AccelBuild(String),

    /// Shader module or pipeline creation failed
    #[error("pipeline creation failed: {0}")]
    Pipeline(String),

    /// Shader library has no bytecode for this entry point
    #[error("shader entry point not found: {0}")]
    MissingShader(String),

    /// Scene references out of range or is empty
    #[error("invalid scene: {0}")]
    InvalidScene(String),

    /// Binding table does not match its layout
    #[error("binding table mismatch: {0}")]
    Binding(String),

    /// Shader binding table was not fully written
    #[error("shader binding table incomplete: {written} of {expected} records written")]
    IncompleteShaderBindingTable { written: usize, expected: usize },

    /// Too many records written to one shader binding table region
    #[error("shader binding table {region} region holds {capacity} records")]
    ShaderBindingTableOverflow { region: &'static str, capacity: usize },

    /// Renderer used before its frame size or scene was set
    #[error("renderer not ready: {0}")]
    NotInitialized(&'static str),

    /// Resource used with the wrong memory class or out of bounds
    #[error("invalid resource access: {0}")]
    ResourceAccess(String),

    /// Command submission failed
    #[error("submission failed: {0}")]
    Submit(String),

    /// Waiting on a fence or for idle failed
    #[error("fence wait failed: {0}")]
    Fence(String),

    /// Copying results back to the host failed
    #[error("readback failed: {0}")]
    Readback(String),

    /// Denoiser reported a failure
    #[error("denoiser failed: {0}")]
    Denoise(String),

    /// Environment map could not be loaded
    #[error("failed to load environment map {path:?}: {reason}")]
    EnvironmentMap { path: PathBuf, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::Submit(_) | Error::Fence(_) | Error::Readback(_) => Severity::FrameFatal,
            Error::EnvironmentMap { .. } | Error::Denoise(_) => Severity::Degraded,
            _ => Severity::SetupFatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_classification() {
        assert_eq!(
            Error::OutOfMemory {
                what: "vertices",
                size: 64
            }
            .severity(),
            Severity::SetupFatal
        );
        assert_eq!(Error::AccelBuild("query".into()).severity(), Severity::SetupFatal);
        assert_eq!(Error::Fence("lost".into()).severity(), Severity::FrameFatal);
        assert_eq!(
            Error::EnvironmentMap {
                path: PathBuf::from("sky.hdr"),
                reason: "missing".into()
            }
            .severity(),
            Severity::Degraded
        );
    }

    #[test]
    fn incomplete_table_message() {
        let err = Error::IncompleteShaderBindingTable {
            written: 3,
            expected: 5,
        };
        assert_eq!(
            err.to_string(),
            "shader binding table incomplete: 3 of 5 records written"
        );
    }
}
