//! Fixtures for session-file generation in tests.
//!
//! Builders write the same JSONL shapes the agent CLI produces, with
//! auto-advancing timestamps and stable uuids, into encoded project
//! directories under a temporary projects root.

mod builder;
mod project;

pub use builder::*;
pub use project::*;
