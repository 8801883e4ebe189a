//! Chat relay core library: key pools, provider adapters, response dispatch, session
//! persistence, and the relay server used by the CLI.

pub mod config;
pub mod dispatch;
pub mod keypool;
pub mod llm;
pub mod relay;
pub mod session;
pub mod transcription;
