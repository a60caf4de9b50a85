//! deckd — TaskDeck's live-sync engine.
//!
//! Consumes the backend's push stream and maintains two pieces of local
//! state for the UI: the ordered lifecycle steps of the current agent run,
//! and a reconciled cache of the user's tasks. Both are published as
//! immutable snapshots; accepted task mutations additionally produce
//! user-visible acknowledgements.
//!
//! Embed via [`pipeline::Pipeline`], or run the `deckd` binary standalone.

pub mod auth;
pub mod backend;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod notify;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod sync;

pub use events::{Event, MutationKind, Priority, Task, TaskMutationEvent};
pub use lifecycle::{LifecycleStep, LifecycleView, StepMachine, StepStatus, StepType};
pub use pipeline::{Pipeline, PipelineViews, StopHandle};
pub use store::{ApplyOutcome, ReconciliationStore, TaskCacheView};
pub use sync::{ChannelState, TaskSyncChannel};
