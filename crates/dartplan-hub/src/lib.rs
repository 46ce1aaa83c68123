// Library root: exposes the Hub client components so the binary and the
// integration tests share one public API.

pub mod api;
pub mod app;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod registration;
pub mod router;
pub mod transport;
