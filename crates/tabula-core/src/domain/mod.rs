//! Domain model (ids, records, schema, batches, manifests, outcomes, ...).
//!
//! 外部システムに依存しない純粋な型だけを置きます。

pub mod attempt;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod job;
pub mod outcome;
pub mod record;
pub mod result;
pub mod schema;
pub mod spec;
pub mod state;
pub mod task;
pub mod usage;

pub use attempt::{CallOutcome, CallRecord};
pub use decision::{RetryDecision, RetryManifest, RetryReason};
pub use errors::{
    BatchFailure, ErrorKind, PersistenceError, ProcessError, SubmitError, TransportError,
    ValidationError,
};
pub use ids::{AttemptId, TaskId};
pub use job::{Batch, BatchJob, BatchStatus};
pub use outcome::{
    BatchSummary, MergedRow, Noise, RepairKind, RepairNote, TaskReport, Unresolved,
    UnresolvedCause,
};
pub use record::{Fields, Record, RecordKey};
pub use result::{ArityMismatch, Row, StructuredResult};
pub use schema::{ColumnDescriptor, ColumnRole, LabelPattern, SchemaError, TableSchema};
pub use spec::{SourceRef, Submission, TaskKind, TaskOptions};
pub use state::TaskStatus;
pub use task::{InvalidTransition, Task};
pub use usage::Usage;
