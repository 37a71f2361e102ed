//! Typed error hierarchy for the stack core.
//!
//! Two top-level enums:
//! - `ComposeError`: building the stack definition (template, override file, env file)
//! - `StackError`: lifecycle, image pipeline and exec failures surfaced to callers

use std::path::PathBuf;
use thiserror::Error;

use crate::engine::EngineError;

/// Errors while rendering or resolving the stack definition.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("Failed to open the compose file {path}: {source}")]
    OverrideRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse compose document {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to read env file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },

    #[error("Service {service} has an invalid port mapping '{spec}'")]
    InvalidPort { service: String, spec: String },

    #[error("Service {service} has an invalid volume mapping '{spec}'")]
    InvalidVolume { service: String, spec: String },

    #[error("Service {service} refers to undefined network {network}")]
    UnknownNetwork { service: String, network: String },

    #[error("Service {service} has no image")]
    MissingImage { service: String },

    #[error("Service {service} depends on undefined service {dependency}")]
    UnknownDependency { service: String, dependency: String },

    #[error("Dependency cycle between services: {0}")]
    DependencyCycle(String),

    #[error("Service {service} has an unterminated quote in its command")]
    UnterminatedQuote { service: String },
}

/// Errors from stack lifecycle, image and exec operations.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("cannot start, project {project} already running")]
    AlreadyRunning { project: String },

    #[error("cannot {operation}, project {project} not running")]
    NotRunning {
        project: String,
        operation: &'static str,
    },

    #[error("{operation}: {source}")]
    Engine {
        operation: &'static str,
        #[source]
        source: EngineError,
    },

    #[error("failed to build image {image}: {source}")]
    Build {
        image: String,
        #[source]
        source: EngineError,
    },

    #[error("failed to push image {image}: {source}")]
    Push {
        image: String,
        #[source]
        source: EngineError,
    },

    #[error("image {reference} not found")]
    ImageNotFound { reference: String },

    #[error("error reading credentials for {registry}: {message}")]
    Credential { registry: String, message: String },

    #[error("no such service: {0}")]
    NoSuchService(String),

    #[error("failed to create project: {0}")]
    Compose(#[from] ComposeError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StackError {
    /// Wrap an engine error with a human-readable description of the operation.
    pub fn engine(operation: &'static str) -> impl FnOnce(EngineError) -> StackError {
        move |source| StackError::Engine { operation, source }
    }

    pub fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> StackError {
        let context = context.into();
        move |source| StackError::Io { context, source }
    }

    pub fn is_not_running(&self) -> bool {
        matches!(self, StackError::NotRunning { .. })
    }
}

pub type Result<T> = std::result::Result<T, StackError>;
