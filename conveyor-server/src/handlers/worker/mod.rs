pub mod ping;
pub mod render_preview;
