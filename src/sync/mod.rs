//! Background replay of queued writes.
//!
//! ```text
//! ┌──────────────┐  online   ┌─────────────────┐  replay  ┌─────────┐
//! │    Probe     │──────────►│ SyncCoordinator │─────────►│ Gateway │
//! └──────────────┘           └─────────────────┘          └─────────┘
//!                                     │
//!                                     ▼
//!                            ┌─────────────────┐
//!                            │ OperationQueue  │
//!                            └─────────────────┘
//! ```

mod coordinator;

pub use coordinator::{DrainOutcome, DrainSummary, FailedOperation, SyncConfig, SyncCoordinator};
