// src/storychain/mod.rs

pub mod agent;
pub mod client_wrapper;
pub mod clients;
pub mod config;
pub mod conversation;
pub mod display;
pub mod event;
pub mod input;
pub mod pipeline;
pub mod run;

// So callers can write storychain::Agent instead of storychain::agent::Agent
pub use agent::Agent;
pub use pipeline::Pipeline;
