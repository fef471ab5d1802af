// Library surface for headless/integration tests and reuse.
// Keep this lean to avoid coupling to bin-only types in main.rs.
pub mod app_dirs;
pub mod backend;
pub mod clock;
pub mod config;
pub mod controller;
pub mod dataset;
pub mod language;
pub mod runtime;
pub mod session;
pub mod signals;
pub mod store;
pub mod submit;
pub mod surface;
pub mod transcript;
