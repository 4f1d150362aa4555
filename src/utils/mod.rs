//! Shared utilities
//!
//! Random number generation, activation helpers and the cooperative
//! cancellation token.

pub mod activations;
pub mod cancel;
pub mod rng;

pub use cancel::CancelEvent;
pub use rng::SimpleRng;
