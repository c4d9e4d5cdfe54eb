//! Session management: shell processes, idle supervision, lifecycle.

pub mod bridge;
pub mod idle;
pub mod manager;
pub mod pipe;
pub mod pty;

pub use bridge::ShellSpawner;
pub use idle::DEFAULT_IDLE_TIMEOUT;
pub use manager::{RegistrySettings, SessionRegistry, Teardown};
pub use pipe::PipeSpawner;
pub use pty::PtySpawner;
