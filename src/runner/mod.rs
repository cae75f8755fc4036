//! The transactional dispatch runner (spec §4.7-§4.10): a nested atomic
//! context stack, a bounded-retry attempt engine built on it, the mailbox
//! state machine it dispatches against, and the worker shell that drives
//! the whole thing in a loop.

pub mod atomic;
pub mod attempt;
pub mod frame;
pub mod mailbox;
pub mod worker;
