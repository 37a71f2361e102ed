//! The capability set the CLI drives, and its local-engine implementation.

use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;

use crate::config::Settings;
use crate::engine::{ContainerEngine, ContainerStatus};
use crate::errors::Result;
use crate::exec::{ExecBridge, ExecIo};
use crate::project::ProjectIdentity;
use crate::stack::{Endpoints, StackController};

#[async_trait]
pub trait ContainerHandler: Send + Sync {
    /// Build the image and bring the stack up. Build output goes to `out`.
    async fn start(&self, no_cache: bool, out: &mut (dyn Write + Send)) -> Result<Endpoints>;
    async fn stop(&self) -> Result<()>;
    async fn kill(&self) -> Result<()>;
    async fn ps(&self) -> Result<Vec<ContainerStatus>>;
    async fn logs(
        &self,
        follow: bool,
        services: &[String],
        sink: &mut (dyn Write + Send),
    ) -> Result<()>;
    /// Run `args` in the webserver container.
    async fn run(&self, args: &[String], user: Option<&str>, io: ExecIo) -> Result<()>;
    async fn get_container_id(&self, role: &str) -> Result<Option<String>>;
    /// Non-interactive `bash -c`; failures are logged and yield partial output.
    async fn exec_command(&self, container_id: &str, command: &str) -> String;
}

/// A stack on the local container engine.
pub struct LocalStack<E: ContainerEngine> {
    stack: StackController<E>,
    exec: ExecBridge<E>,
    run_role: String,
}

impl<E: ContainerEngine> LocalStack<E> {
    pub fn new(engine: Arc<E>, project: ProjectIdentity, settings: &Settings) -> Self {
        Self {
            exec: ExecBridge::new(Arc::clone(&engine)),
            stack: StackController::new(engine, project, settings),
            run_role: settings.webserver_container_name.clone(),
        }
    }

    pub fn from_parts(stack: StackController<E>, exec: ExecBridge<E>, settings: &Settings) -> Self {
        Self {
            stack,
            exec,
            run_role: settings.webserver_container_name.clone(),
        }
    }

    pub fn stack(&self) -> &StackController<E> {
        &self.stack
    }
}

#[async_trait]
impl<E: ContainerEngine> ContainerHandler for LocalStack<E> {
    async fn start(&self, no_cache: bool, out: &mut (dyn Write + Send)) -> Result<Endpoints> {
        self.stack.start(no_cache, out).await
    }

    async fn stop(&self) -> Result<()> {
        self.stack.stop().await
    }

    async fn kill(&self) -> Result<()> {
        self.stack.kill().await
    }

    async fn ps(&self) -> Result<Vec<ContainerStatus>> {
        self.stack.status().await
    }

    async fn logs(
        &self,
        follow: bool,
        services: &[String],
        sink: &mut (dyn Write + Send),
    ) -> Result<()> {
        self.stack.logs(follow, services, sink).await
    }

    async fn run(&self, args: &[String], user: Option<&str>, io: ExecIo) -> Result<()> {
        self.exec
            .run(&self.stack, &self.run_role, args, user, io)
            .await
    }

    async fn get_container_id(&self, role: &str) -> Result<Option<String>> {
        self.stack.resolve_container(role).await
    }

    async fn exec_command(&self, container_id: &str, command: &str) -> String {
        self.exec.exec_command(container_id, command).await
    }
}
