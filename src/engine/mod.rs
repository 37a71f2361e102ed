//! Container engine boundary.
//!
//! Everything the stack needs from the local daemon goes through the
//! [`ContainerEngine`] trait: project-scoped container queries, the
//! network/volume/container primitives compose semantics are built from,
//! image build/tag/push, and exec sessions.
//!
//! Real implementation: [`docker::DockerEngine`]. Test double: `fake::FakeEngine`.

pub mod docker;
#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWrite;

pub use docker::DockerEngine;

pub const LABEL_PROJECT: &str = "com.docker.compose.project";
pub const LABEL_SERVICE: &str = "com.docker.compose.service";
pub const LABEL_CONTAINER_NUMBER: &str = "com.docker.compose.container-number";
pub const LABEL_ONEOFF: &str = "com.docker.compose.oneoff";
pub const LABEL_CONFIG_HASH: &str = "com.docker.compose.config-hash";
pub const LABEL_NETWORK: &str = "com.docker.compose.network";
pub const LABEL_VOLUME: &str = "com.docker.compose.volume";

/// First token of a running container's free-text state ("Up 2 minutes").
pub const STATE_UP: &str = "Up";

/// Errors reported by the container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot connect to the container engine: {0}")]
    Connect(String),

    #[error("container engine returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("{0}")]
    Stream(String),

    #[error("I/O error talking to the container engine: {0}")]
    Io(#[from] std::io::Error),

    #[error("container engine error: {0}")]
    Other(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::Api { status: 404, .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Api { status: 409, .. })
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Compare only the first whitespace-delimited token of a state string.
pub fn state_matches(state: &str, expected: &str) -> bool {
    state.split_whitespace().next().unwrap_or("") == expected
}

/// A port published by a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    pub private_port: u16,
    pub public_port: Option<u16>,
    pub protocol: String,
}

/// Snapshot of one project container. Always re-fetched, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub id: String,
    pub name: String,
    /// Compose service the container belongs to, when labelled.
    pub service: Option<String>,
    /// Free-text engine state such as "Up 2 minutes" or "Exited (0) 3 seconds ago".
    pub state: String,
    pub ports: Vec<PublishedPort>,
    pub config_hash: Option<String>,
    /// Id of the image the container was created from.
    pub image_id: Option<String>,
}

impl ContainerStatus {
    pub fn is_up(&self) -> bool {
        state_matches(&self.state, STATE_UP)
    }
}

/// Host publication of a container port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
    pub container_port: u16,
    pub protocol: String,
}

impl PortMapping {
    /// Engine key for the container side, e.g. `8080/tcp`.
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

/// Fully resolved container definition handed to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    /// `KEY=VALUE` pairs, sorted by key.
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortMapping>,
    /// Bind strings in engine form: `source:target[:mode]`.
    pub binds: Vec<String>,
    pub network: Option<String>,
    pub aliases: Vec<String>,
    pub restart: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: Option<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// A chunk of multiplexed container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    StdOut(Vec<u8>),
    StdErr(Vec<u8>),
    /// Output of a TTY-attached process, not split by stream.
    Console(Vec<u8>),
}

impl OutputChunk {
    pub fn bytes(&self) -> &[u8] {
        match self {
            OutputChunk::StdOut(b) | OutputChunk::StdErr(b) | OutputChunk::Console(b) => b,
        }
    }
}

pub type OutputStream = BoxStream<'static, EngineResult<OutputChunk>>;

/// One line of build or push progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressMessage {
    pub id: Option<String>,
    pub text: String,
}

impl ProgressMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
        }
    }
}

pub type ProgressStream = BoxStream<'static, EngineResult<ProgressMessage>>;

/// Image build submission: a tar payload plus the tag to apply.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub tag: String,
    pub dockerfile: String,
    pub no_cache: bool,
    pub context: Vec<u8>,
}

/// Credentials attached to a push. The engine client encodes them for the
/// registry-auth header.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: Option<String>,
    pub password: Option<String>,
    pub server_address: String,
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("server_address", &self.server_address)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub cmd: Vec<String>,
    pub user: Option<String>,
    pub attach_stdin: bool,
}

/// Duplex stream of an attached exec: output is read by one side, input is
/// written by the other.
pub struct ExecStream {
    pub output: OutputStream,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

/// Operations the stack core issues against the container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// All containers (running or not) labelled with the given project.
    async fn list_containers(&self, project: &str) -> EngineResult<Vec<ContainerStatus>>;

    async fn list_networks(&self, project: &str) -> EngineResult<Vec<String>>;
    async fn create_network(&self, spec: &NetworkSpec) -> EngineResult<()>;
    async fn remove_network(&self, name: &str) -> EngineResult<()>;

    async fn list_volumes(&self, project: &str) -> EngineResult<Vec<String>>;
    async fn create_volume(&self, spec: &VolumeSpec) -> EngineResult<()>;
    async fn remove_volume(&self, name: &str) -> EngineResult<()>;

    /// Returns the new container id.
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String>;
    async fn start_container(&self, id: &str) -> EngineResult<()>;
    async fn stop_container(&self, id: &str, timeout: Duration) -> EngineResult<()>;
    async fn remove_container(&self, id: &str, remove_volumes: bool) -> EngineResult<()>;
    fn container_logs(&self, id: &str, follow: bool) -> OutputStream;

    fn build_image(&self, request: BuildRequest) -> ProgressStream;
    async fn tag_image(&self, source: &str, repository: &str, tag: &str) -> EngineResult<()>;
    fn push_image(&self, repository: &str, tag: &str, auth: RegistryAuth) -> ProgressStream;
    async fn remove_image(&self, reference: &str) -> EngineResult<()>;
    /// Ids of local images matching a `repository:tag` reference filter.
    async fn find_images(&self, reference: &str) -> EngineResult<Vec<String>>;
    async fn image_labels(&self, image_id: &str) -> EngineResult<HashMap<String, String>>;

    /// Returns the exec id.
    async fn create_exec(&self, container_id: &str, options: &ExecOptions) -> EngineResult<String>;
    async fn start_exec(&self, exec_id: &str) -> EngineResult<ExecStream>;
    async fn exec_exit_code(&self, exec_id: &str) -> EngineResult<Option<i64>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_matches_first_token_only() {
        assert!(state_matches("Up 2 minutes", "Up"));
        assert!(state_matches("Up", "Up"));
        assert!(state_matches("  Up  ", "Up"));
        assert!(!state_matches("Exited (0) 3 seconds ago", "Up"));
        assert!(!state_matches("Upgrading", "Up"));
        assert!(!state_matches("", "Up"));
    }

    #[test]
    fn test_container_status_is_up() {
        let mut status = ContainerStatus {
            id: "abc".into(),
            name: "proj-webserver-1".into(),
            service: Some("webserver".into()),
            state: "Up 5 seconds (healthy)".into(),
            ports: vec![],
            config_hash: None,
            image_id: None,
        };
        assert!(status.is_up());
        status.state = "Created".into();
        assert!(!status.is_up());
    }

    #[test]
    fn test_registry_auth_debug_redacts_password() {
        let auth = RegistryAuth {
            username: Some("user".into()),
            password: Some("s3cret".into()),
            server_address: "registry.example.com".into(),
        };
        let rendered = format!("{:?}", auth);
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_engine_error_classification() {
        let missing = EngineError::Api {
            status: 404,
            message: "no such container".into(),
        };
        assert!(missing.is_not_found());
        assert!(!missing.is_conflict());
        let conflict = EngineError::Api {
            status: 409,
            message: "already exists".into(),
        };
        assert!(conflict.is_conflict());
    }
}
