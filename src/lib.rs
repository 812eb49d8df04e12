//! Aule: worker lifecycle and scheduling engine.

pub mod config;
pub mod error;
pub mod events;
pub mod llm;
pub mod runtime;
pub mod settings;
pub mod store;
pub mod worker;
