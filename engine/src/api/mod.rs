pub mod auth;
pub mod router;
pub mod state;
pub mod ws;

pub use router::router;
pub use state::ApiState;
