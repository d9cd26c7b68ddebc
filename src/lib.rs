// Library root
// -----------
// Client library for the campus cloud-storage service. The binary
// (`main.rs`) only sets up logging and hands a `Config` to the UI.
//
// Module responsibilities:
// - `auth`: QR-code handshake state machine and its driver.
// - `upload`: chunked multipart upload pipeline.
// - `session`: persisted session plus single-flight re-authentication.
// - `api`: wire types, the seams the coordinators use, and the HTTP /
//   WebSocket implementation behind them.
// - `chunk`, `retry`, `error`, `config`: shared building blocks.
// - `client`: facade combining the above for the CLI.
// - `ui`: terminal menu flows.
pub mod api;
pub mod auth;
pub mod chunk;
pub mod client;
pub mod config;
pub mod error;
pub mod retry;
pub mod session;
pub mod ui;
pub mod upload;

pub use client::{CloudClient, OperationError};
pub use config::Config;
pub use session::{Session, SessionStore};
