//! Machine abstraction core for the Hangar deployment orchestrator.
//!
//! The crate models machines across heterogeneous backends (EC2, GCE,
//! Hetzner, containers, local VMs and pre-existing hosts) behind one
//! [`Machine`] contract, persists their lifecycle state through an explicit
//! save/load boundary, and implements the operations that bring a machine to
//! its desired configuration: health checks, secret provisioning, reboots,
//! VPN key provisioning, closure transfer and configuration switching.
//!
//! External effects go through the capabilities bundled in
//! [`MachineContext`], so the protocol can be exercised without a network.

pub mod backends;
pub mod closure;
pub mod config;
pub mod definition;
pub mod keys;
pub mod machine;
pub mod port;
pub mod probe;
pub mod registry;
pub mod runner;
pub mod scratch;
pub mod ssh;
pub mod state;
pub mod test_support;

pub use closure::{ClosureStore, NixStore, StoreError};
pub use config::{ConfigError, SshConfig, ToolchainConfig};
pub use definition::{Definition, DefinitionError, KeySpec, MachineDefinition, RawDefinition};
pub use machine::{
    Machine, MachineContext, MachineCore, MachineError, OperationOutcome, UnsupportedOperation,
};
pub use port::{PortError, PortProbe, PortState, TcpPortProbe};
pub use probe::CheckResult;
pub use registry::{
    BackendRegistry, DefinitionRecord, RegistryError, ResourceState, create_definition,
    create_state,
};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessCommandRunner, ProcessError};
pub use scratch::{ScratchDir, ScratchError};
pub use ssh::{FileTransfer, RemoteCommand, RemoteOutput, RemoteShell, SshError, SshTarget, SshTransport};
pub use state::{
    AttributeStore, JsonFileStore, LifecycleState, MachineState, MemoryStore, ResourceId,
    StateError,
};
