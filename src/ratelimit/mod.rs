//! Rate limiting logic and state management.

mod engine;
mod evictor;
mod policy;
mod store;
mod tiers;

pub use engine::PolicyEngine;
pub use evictor::Evictor;
pub use policy::{KeyStrategy, PolicyError, RatePolicy};
pub use store::{Decision, StoreError, WindowState, WindowStore};
pub use tiers::{PolicyComposer, ScopedPolicy};
