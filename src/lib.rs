pub mod agents;
pub mod audit;
pub mod bridge;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod pipeline;
pub mod retry;
