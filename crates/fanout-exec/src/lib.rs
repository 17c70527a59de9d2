//! fanout-exec: Remote execution transports
//!
//! Provides the `Transport`/`Session` traits, an SSH implementation on top of
//! russh, a local implementation, and non-interactive credential resolution.

pub mod credentials;
pub mod error;
pub mod local;
pub mod result;
pub mod ssh;
pub mod traits;

pub use credentials::{
    Credential, CredentialError, CredentialResolver, CredentialSource, MapVault, Secret,
    SecretString, SecretVault,
};
pub use error::TransportError;
pub use local::LocalTransport;
pub use result::{CommandOutput, HostSpec};
pub use ssh::{HostKeyCheck, SshTransport};
pub use traits::{Session, Transport};
