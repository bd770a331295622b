//! A chat assistant split across two execution contexts.
//!
//! The background service owns every network call and the credential; the
//! foreground agent owns the widget and its conversations. They talk only
//! through the [`relay`] bus and the shared [`store`].

pub mod api;
pub mod app;
pub mod config;
pub mod event;
pub mod foreground;
pub mod logging;
pub mod relay;
pub mod store;
pub mod tui;
pub mod ui;

pub use config::RelayConfig;
pub use foreground::{ForegroundAgent, ForegroundError};
pub use relay::{BackgroundService, RelayBus, RelayRequest, RelayResult};
