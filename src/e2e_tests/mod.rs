//! End-to-end scenarios driving the client against in-crate servers


pub mod file_operations;
#[cfg(feature = "local")]
pub mod local_loopback;
pub mod session_lifecycle;
pub mod share_lifecycle;

pub use test_context::TestContext;
