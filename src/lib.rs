//! Casework: staged clinical reasoning over generation providers
//!
//! A case moves through nine backend stages, summarised in three groups. Each
//! stage's output is generated with retry and a time budget, persisted, and can
//! be delivered live as a word-respecting event stream.

pub mod chunker;
pub mod cli;
pub mod config;
pub mod error;
pub mod generation;
pub mod logging;
pub mod provider;
pub mod store;
pub mod stream;
pub mod workflow;
