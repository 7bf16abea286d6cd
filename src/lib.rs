pub mod cache;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod definition;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod observation;
pub mod pipeline;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod signals;
pub mod sqlx_session;
pub mod tailer;

pub use logging::init_tracing;
