pub mod embedded;
pub mod instance;
pub mod loader;
pub mod manifest;
pub mod throttle;
