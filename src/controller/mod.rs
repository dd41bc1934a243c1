pub mod clock;
pub mod deployment;
pub mod store;
pub mod strategies;

pub use deployment::{reconcile, Context, ReconcileError};
