pub mod config;
pub mod error;
pub mod gemini;
pub mod model;
pub mod orchestrator;
pub mod project;
pub mod wizard;
