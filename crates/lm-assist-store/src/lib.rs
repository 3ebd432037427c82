mod executions;
mod monitor;
mod persist;
mod tasks;

pub use executions::*;
pub use monitor::*;
pub use persist::*;
pub use tasks::*;
