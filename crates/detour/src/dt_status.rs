//! Status words for query operations
//!
//! Hard failures are reported through [`detour_common::Error`]. A `DtStatus`
//! travels next to successful results and carries the detail bits that a
//! caller may want to act on (a partial path, a truncated buffer, an exhausted
//! node pool) without treating them as errors.

use std::fmt;

bitflags::bitflags! {
    /// Bit set describing the outcome of a query.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct DtStatus: u32 {
        /// Operation failed
        const FAILURE = 1 << 31;
        /// Operation succeeded
        const SUCCESS = 1 << 30;
        /// Operation still in progress
        const IN_PROGRESS = 1 << 29;

        /// Input data is not recognized
        const WRONG_MAGIC = 1 << 0;
        /// Input data is in wrong version
        const WRONG_VERSION = 1 << 1;
        /// Operation ran out of memory
        const OUT_OF_MEMORY = 1 << 2;
        /// An input parameter was invalid
        const INVALID_PARAM = 1 << 3;
        /// Result buffer for the query was too small to store all results
        const BUFFER_TOO_SMALL = 1 << 4;
        /// Query ran out of nodes during search
        const OUT_OF_NODES = 1 << 5;
        /// Query did not reach the end location, returning best guess
        const PARTIAL_RESULT = 1 << 6;
        /// A tile has already been assigned to the given x,y coordinate
        const ALREADY_OCCUPIED = 1 << 7;
    }
}

impl DtStatus {
    /// Mask selecting the detail bits
    pub const DETAIL_MASK: u32 = 0x0ff_ffff;

    /// Success with the given detail bits
    pub fn success_with(details: DtStatus) -> Self {
        DtStatus::SUCCESS | details.details()
    }

    pub fn is_success(&self) -> bool {
        self.contains(DtStatus::SUCCESS)
    }

    pub fn is_failure(&self) -> bool {
        self.contains(DtStatus::FAILURE)
    }

    pub fn is_in_progress(&self) -> bool {
        self.contains(DtStatus::IN_PROGRESS)
    }

    /// True when the search did not reach its goal.
    pub fn is_partial(&self) -> bool {
        self.contains(DtStatus::PARTIAL_RESULT)
    }

    /// Detail bits only.
    pub fn details(&self) -> DtStatus {
        DtStatus::from_bits_truncate(self.bits() & Self::DETAIL_MASK)
    }
}

impl fmt::Display for DtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_failure() {
            "failure"
        } else if self.is_in_progress() {
            "in progress"
        } else if self.is_success() {
            "success"
        } else {
            "unknown"
        };
        write!(f, "{state}")?;

        let details = self.details();
        if !details.is_empty() {
            let names: Vec<&str> = details.iter_names().map(|(name, _)| name).collect();
            write!(f, " ({})", names.join(", "))?;
        }
        Ok(())
    }
}

/// Number of entries written into a caller buffer plus status details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryResult {
    /// Entries written to the output buffer.
    pub count: usize,
    /// Entries the complete answer needs; larger than `count` when truncated.
    pub required: usize,
    pub status: DtStatus,
}

impl QueryResult {
    pub fn new(count: usize, required: usize, status: DtStatus) -> Self {
        Self {
            count,
            required,
            status,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.status.is_partial()
    }

    pub fn is_truncated(&self) -> bool {
        self.status.contains(DtStatus::BUFFER_TOO_SMALL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_bits() {
        let status = DtStatus::SUCCESS | DtStatus::PARTIAL_RESULT | DtStatus::OUT_OF_NODES;
        assert!(status.is_success());
        assert!(!status.is_failure());
        assert!(status.is_partial());
        assert_eq!(
            status.details(),
            DtStatus::PARTIAL_RESULT | DtStatus::OUT_OF_NODES
        );
    }

    #[test]
    fn test_success_with_drops_high_bits() {
        let carried = DtStatus::IN_PROGRESS | DtStatus::BUFFER_TOO_SMALL;
        let status = DtStatus::success_with(carried);
        assert!(status.is_success());
        assert!(!status.is_in_progress());
        assert!(status.contains(DtStatus::BUFFER_TOO_SMALL));
    }

    #[test]
    fn test_display() {
        let status = DtStatus::SUCCESS | DtStatus::PARTIAL_RESULT;
        assert_eq!(status.to_string(), "success (PARTIAL_RESULT)");
        assert_eq!(DtStatus::FAILURE.to_string(), "failure");
    }
}
