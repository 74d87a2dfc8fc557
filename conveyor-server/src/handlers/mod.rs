pub mod jobs;
pub mod queues;
pub mod utils;
pub mod worker;
