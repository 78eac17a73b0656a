pub mod auth;
pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod heartbeat;
pub mod host;
pub mod logging;
pub mod registry;
pub mod sender;
pub mod store;
pub mod survival;

pub use auth::Credentials;
pub use bridge::{Bridge, Collaborators};
pub use config::{BridgeConfig, BridgeSettings};
pub use dispatch::MainThreadDispatcher;
pub use envelope::{
    ClientInfo, CommandRequest, CompilationResult, Diagnostic, Inbound, Outbound, Severity,
};
pub use host::{CommandExecutor, ContextProvider, EmptyContext, HostInfo};
pub use registry::{CloseReason, ConnectionState};
pub use store::{DurableStore, FileStore, MemoryStore};
pub use survival::SurvivalState;
