//! JEX Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the JEX journal export tools.
//!
//! # Overview
//!
//! - **Error Handling**: `JexError` and the `Result` alias
//! - **Logging**: tracing subscriber setup driven by `LogConfig`
//! - **Types**: partition offset ranges and progress messages
//! - **Digests**: `NodeId` identity digests used for deduplication
//!
//! # Example
//!
//! ```no_run
//! use jex_common::types::{OffsetRanges, PartitionOffsetRange};
//!
//! fn main() -> jex_common::Result<()> {
//!     let ranges: OffsetRanges = [
//!         PartitionOffsetRange::new(0, 0, 100)?,
//!         PartitionOffsetRange::new(1, 7, 7)?,
//!     ]
//!     .into_iter()
//!     .collect();
//!     assert_eq!(ranges.total(), 100);
//!     Ok(())
//! }
//! ```

pub mod digest;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use digest::NodeId;
pub use error::{JexError, Result};
pub use types::{Offset, OffsetRanges, PartitionId, PartitionOffsetRange, ProgressMessage};
