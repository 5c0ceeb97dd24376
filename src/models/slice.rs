use std::fmt;

/// One compressed image slice waiting in a bag's queue.
///
/// The buffer is owned by the bag's pending queue until a worker dequeues it.
/// The worker then owns it for the duration of decompression and drops it once
/// the decoded samples have been written into the bag's volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceBuffer {
    index: usize,
    payload: Vec<u8>,
}

impl SliceBuffer {
    /// Wrap a compressed payload for the slice at `index`.
    pub fn new(index: usize, payload: Vec<u8>) -> Self {
        Self { index, payload }
    }

    /// Position of this slice within the bag's volume
    pub fn index(&self) -> usize {
        self.index
    }

    /// Compressed payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Kind of work a decompression worker is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Decode one pending slice into the bag's volume
    Decompression,

    /// Reserved for re-encoding volumes; currently completes as a no-op
    Compression,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Decompression => write!(f, "decompression"),
            TaskKind::Compression => write!(f, "compression"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_buffer_accessors() {
        let slice = SliceBuffer::new(3, vec![1, 2, 3, 4]);

        assert_eq!(slice.index(), 3);
        assert_eq!(slice.len(), 4);
        assert!(!slice.is_empty());
        assert_eq!(slice.payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_task_kind_display() {
        assert_eq!(TaskKind::Decompression.to_string(), "decompression");
        assert_eq!(TaskKind::Compression.to_string(), "compression");
    }
}
