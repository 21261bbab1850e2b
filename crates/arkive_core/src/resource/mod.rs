//! Resource state machine.

mod state;
mod store;

pub use state::{AcquireMode, ResourceState};
pub use store::ResourceStore;
