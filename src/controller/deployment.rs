pub mod cleanup;
pub mod machineset;
pub mod reconcile;
pub mod resolver;
pub mod scaling;
pub mod status;
pub mod validation;

#[cfg(test)]
pub(crate) mod fixtures;

// Re-export everything so callers can use `controller::deployment::*`
pub use cleanup::*;
pub use machineset::*;
pub use reconcile::*;
pub use resolver::*;
pub use scaling::*;
pub use status::*;
pub use validation::*;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "deployment_test.rs"]
mod tests;
