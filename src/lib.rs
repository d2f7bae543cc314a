pub mod api;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod images;
pub mod listen;
pub mod network;
pub mod orchestrator;
pub mod proxy;
pub mod runtime;
pub mod tunnel;

pub use config::Config;
pub use endpoint::EndpointDirectory;
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
