pub mod bootstrap;
pub mod events;
pub mod handlers;
pub mod router;

pub use bootstrap::{bind_with_fallback, serve, BootstrapError, ShutdownController};
pub use router::router;
