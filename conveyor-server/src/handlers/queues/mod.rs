pub mod enqueue;
pub mod flush;
pub mod list;
