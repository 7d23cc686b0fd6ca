//! The AgentForge execution engine: the per-session reason-act loop and
//! the runtime command surface (submit / pause / resume / continue /
//! abort) a transport façade would call.

pub mod loop_runner;
pub mod runtime;

pub use loop_runner::{AgentLoop, LoopSettings};
pub use runtime::AgentRuntime;
