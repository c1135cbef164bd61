pub mod config;
pub mod job;
pub mod mapping;
pub mod orchestrator;
pub mod precompute;
pub mod renderer;
