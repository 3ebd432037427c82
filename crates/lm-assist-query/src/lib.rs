mod change_check;
mod conversation;
mod listing;
mod service;
mod subagents;

pub use change_check::*;
pub use conversation::*;
pub use listing::*;
pub use service::*;
pub use subagents::*;
