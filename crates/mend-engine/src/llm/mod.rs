pub mod agentic;
pub mod client;
pub mod compress;
pub mod models;
pub mod prompts;
pub mod synth;
pub mod tools;
