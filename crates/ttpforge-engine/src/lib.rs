//! Orchestrator: validates a loaded plan end to end, then runs it — pushing
//! a LIFO cleanup stack as steps succeed and unwinding it once forward
//! progress stops, whether by completion or failure.

pub mod cleanup;
pub mod events;
pub mod orchestrate;
pub mod state;
pub mod validate;

pub use cleanup::{CleanupEntry, CleanupStack};
pub use events::{EventEmitter, RunEvent};
pub use orchestrate::{run, RunConfig, RunReport};
pub use state::StepState;
pub use validate::{validate_plan, ResolvedStep, BINARY_SENTINEL};
