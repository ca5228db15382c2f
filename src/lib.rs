//! Sandboxed execution for AI coding agents.
//!
//! A [`sandbox::SandboxProvider`] gives the agent an isolated Linux
//! workspace (a managed remote VM or a local Docker container) with
//! command execution, file transfer, PTYs, preview URLs, and hard-link
//! checkpoints of the home directory. A [`transport::CommandTransport`]
//! runs the agent CLI inside that workspace and streams its JSON events
//! back out; [`turn::TurnRunner`] drives one prompt through the
//! transport into an [`events::EventLog`] that clients replay and
//! follow, and can be cut short through [`events::RevocationRegistry`].

pub mod config;
pub mod events;
pub mod pty;
pub mod queue;
pub mod retry;
pub mod sandbox;
pub mod transport;
pub mod turn;

pub use config::Settings;
pub use events::{EventLog, RevocationRegistry, StreamEntry, StreamEventKind};
pub use pty::PtySessionManager;
pub use sandbox::{SandboxError, SandboxProvider, build_provider};
pub use transport::{AgentOptions, CommandTransport, TransportState};
pub use turn::{TurnRunner, TurnStatus};

/// Install the default tracing subscriber. `RUST_LOG` overrides the
/// filter; embedding applications with their own subscriber skip this.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agentbox=info,bollard=warn,hyper=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
