//! Seams between the scheduler loop and its external collaborators.

pub mod channel;
pub mod store;

pub use channel::ChangeChannel;
pub use store::JobStore;
