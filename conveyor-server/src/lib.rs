//! Conveyor server: the job admin HTTP API plus the helpers the `conveyor`
//! binary uses to wire configuration into the job engine.

pub mod app;
pub mod background;
pub mod config_helpers;
pub mod error;
pub mod handlers;
pub mod state;

pub use app::build_router;
pub use state::AppState;
