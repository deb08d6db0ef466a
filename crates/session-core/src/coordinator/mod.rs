//! Session Supervisor
//!
//! Top-level orchestration: one supervisor per local party, one actor task
//! per session.

pub mod events;
pub mod registry;
mod session_task;
pub mod supervisor;

pub use events::{SessionEvent, SessionEventBus};
pub use registry::{ActiveSession, SessionOutcome, SessionRegistry, SupervisorStats};
pub use supervisor::{SessionHandle, SessionSupervisor, SessionSupervisorBuilder};
