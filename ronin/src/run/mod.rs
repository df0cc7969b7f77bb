//! Run state: contexts, cancellation, events, and the process-wide registry.

mod abort;
mod context;
mod events;
mod loop_context;
mod manager;

pub use abort::{AbortController, AbortSignal};
pub use context::{MessageLog, RunContext, RunContextBuilder};
pub use events::{RunEvent, RunEventKind, RunState, RunStatus};
pub use loop_context::LoopContext;
pub use manager::{
    Cache, EventBus, RunListener, RunManager, TraceSink, CACHE_TTL, DEFAULT_REPLAY_CAPACITY,
};
