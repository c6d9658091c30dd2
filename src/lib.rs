//! Text to audio through three engines: a cloud speech endpoint, the local
//! `espeak-ng` driver and offline Piper neural voices.
//!
//! [`dispatcher::Synthesizer`] is the entry point shared by the CLI and
//! the HTTP API in [`api`].

pub mod api;
pub mod backends;
pub mod chunking;
pub mod config_loader;
pub mod dispatcher;
pub mod document;
pub mod engine;
pub mod error;
pub mod model_repo;

pub use dispatcher::{Backend, PiperOptions, SynthesisRequest, Synthesizer};
pub use error::{Result, TtsError};
