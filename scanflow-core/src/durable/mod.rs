//! Durable workflow substrate: checkpointed steps, a durable clock, a signal
//! bus with replay-safe cursors, named queues and an executor runtime.

pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod events;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod record;
pub mod runtime;
pub mod signal;
pub mod store;
pub mod workflow;

pub use client::{DurableClient, SubmitRequest, Submitted, WorkflowClient, WorkflowHandle};
pub use config::{DIRECT_QUEUE, LeaseConfig, QueueConfig, RetryConfig, RuntimeConfig};
pub use context::WorkflowContext;
pub use events::{EventKind, EventLog, WorkflowEvent};
pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use record::{InsertOutcome, NewWorkflow, WorkflowId, WorkflowRecord, WorkflowStatus};
pub use runtime::WorkflowRuntime;
pub use signal::{Signal, SignalBus};
pub use store::{DurableStore, WorkflowStore};
pub use workflow::{ErasedWorkflow, Workflow, WorkflowRegistry};
