pub mod manager;
pub mod reaper;
pub mod store;

#[cfg(test)]
mod tests;

pub use manager::{AuthSessionManager, Authz, CascadeObserver};
pub use reaper::Reaper;
pub use store::TokenStore;
