//! newbot core library: connection registry, message normalizer, session router,
//! streaming relay and the gateway that ties them together, plus the agent,
//! memory and audio collaborators used by the CLI.

pub mod agent;
pub mod audio;
pub mod client;
pub mod config;
pub mod envelope;
pub mod gateway;
pub mod init;
pub mod llm;
pub mod memory;
pub mod registry;
pub mod relay;
pub mod router;
pub mod session;
