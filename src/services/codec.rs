use thiserror::Error;

/// Failures reported by a slice codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The vendor library returned a non-zero status code
    #[error("codec returned status {0}")]
    Status(i32),

    #[error("decoded slice needs {needed} bytes, destination holds {capacity}")]
    DestinationTooSmall { needed: usize, capacity: usize },
}

impl CodecError {
    /// Numeric status as surfaced in logs and events
    pub fn code(&self) -> i32 {
        match self {
            CodecError::Status(code) => *code,
            CodecError::DestinationTooSmall { .. } => -1,
        }
    }
}

/// Call contract of the external slice decoder (JPEG-LS in production).
///
/// `decode` writes 16-bit samples into `dst`, whose length is the configured
/// slice resolution times two, and returns the number of bytes written.
/// Implementations are shared by every worker thread.
#[cfg_attr(test, mockall::automock)]
pub trait SliceCodec: Send + Sync {
    fn decode(&self, dst: &mut [u8], src: &[u8]) -> Result<usize, CodecError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Codec for slices that arrive uncompressed: copies the payload verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCodec;

impl SliceCodec for PassthroughCodec {
    fn decode(&self, dst: &mut [u8], src: &[u8]) -> Result<usize, CodecError> {
        if src.len() > dst.len() {
            return Err(CodecError::DestinationTooSmall {
                needed: src.len(),
                capacity: dst.len(),
            });
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}
