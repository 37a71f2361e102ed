//! Stack controller: lifecycle of one project's local stack.
//!
//! The engine is the only source of truth. Every call re-reads container
//! state and rebuilds the stack definition; nothing is cached between calls.

use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::compose::{ComposeService, ProjectPlan, StackDefinition};
use crate::config::Settings;
use crate::engine::{ContainerEngine, ContainerStatus};
use crate::errors::{Result, StackError};
use crate::exec::ContainerResolver;
use crate::image::{BuildContext, ImagePipeline};
use crate::project::ProjectIdentity;

/// Per-container grace period for `stop` before the engine kills it.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Observable lifecycle state of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    /// No containers exist.
    Absent,
    /// At least one container is up.
    Running,
    /// Containers exist but none is up.
    Stopped,
}

impl StackState {
    pub fn from_statuses(statuses: &[ContainerStatus]) -> Self {
        if statuses.is_empty() {
            StackState::Absent
        } else if statuses.iter().any(ContainerStatus::is_up) {
            StackState::Running
        } else {
            StackState::Stopped
        }
    }
}

/// What a freshly started stack exposes on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub webserver_port: String,
    pub postgres_port: String,
    pub username: String,
    pub password: String,
}

pub struct StackController<E: ContainerEngine> {
    project: ProjectIdentity,
    settings: Settings,
    env_file: String,
    compose: ComposeService<E>,
    images: ImagePipeline<E>,
}

impl<E: ContainerEngine> StackController<E> {
    pub fn new(engine: Arc<E>, project: ProjectIdentity, settings: &Settings) -> Self {
        let images = ImagePipeline::new(Arc::clone(&engine), project.image_repository());
        Self {
            env_file: settings.env_file.clone(),
            settings: settings.clone(),
            compose: ComposeService::new(engine),
            images,
            project,
        }
    }

    /// Use a different env file than the configured one.
    pub fn with_env_file(mut self, env_file: impl Into<String>) -> Self {
        self.env_file = env_file.into();
        self
    }

    pub fn with_images(mut self, images: ImagePipeline<E>) -> Self {
        self.images = images;
        self
    }

    pub fn project(&self) -> &ProjectIdentity {
        &self.project
    }

    pub fn images(&self) -> &ImagePipeline<E> {
        &self.images
    }

    fn definition(&self) -> Result<ProjectPlan> {
        let definition = StackDefinition::build(&self.project, &self.settings, &self.env_file)?;
        Ok(definition.plan()?)
    }

    /// Every project container, stopped ones included. Empty means absent.
    pub async fn status(&self) -> Result<Vec<ContainerStatus>> {
        self.compose.ps(self.project.name()).await
    }

    pub async fn state(&self) -> Result<StackState> {
        Ok(StackState::from_statuses(&self.status().await?))
    }

    /// Build the runtime image and bring every service up.
    ///
    /// Rejected while any container is up. Build output goes to `out`.
    pub async fn start(&self, no_cache: bool, out: &mut (dyn Write + Send)) -> Result<Endpoints> {
        let statuses = self.status().await?;
        if statuses.iter().any(ContainerStatus::is_up) {
            return Err(StackError::AlreadyRunning {
                project: self.project.name().to_string(),
            });
        }

        let plan = self.definition()?;

        let context = BuildContext::new(self.project.dir(), &self.settings.dockerfile, no_cache);
        self.images.build(&context, out).await?;

        info!(project = %self.project, services = plan.services.len(), "starting project");
        self.compose.up(&plan).await?;

        Ok(Endpoints {
            webserver_port: self.settings.webserver_host_port().to_string(),
            postgres_port: self.settings.postgres_port.clone(),
            username: "admin".to_string(),
            password: "admin".to_string(),
        })
    }

    /// Stop running containers, keeping containers, volumes and networks.
    pub async fn stop(&self) -> Result<()> {
        match StackState::from_statuses(&self.status().await?) {
            StackState::Absent => Err(StackError::NotRunning {
                project: self.project.name().to_string(),
                operation: "stop",
            }),
            StackState::Stopped => {
                info!(project = %self.project, "project already stopped");
                Ok(())
            }
            StackState::Running => {
                let plan = self.definition()?;
                self.compose.stop(&plan, STOP_TIMEOUT).await
            }
        }
    }

    /// Remove containers (orphans included), networks and volumes.
    pub async fn kill(&self) -> Result<()> {
        info!(project = %self.project, "removing project");
        self.compose.down(self.project.name(), true).await
    }

    /// Stream logs of `services` (all when empty) into `sink`.
    pub async fn logs(
        &self,
        follow: bool,
        services: &[String],
        sink: &mut (dyn Write + Send),
    ) -> Result<()> {
        if self.status().await?.is_empty() {
            return Err(StackError::NotRunning {
                project: self.project.name().to_string(),
                operation: "view logs",
            });
        }
        self.compose
            .logs(self.project.name(), services, follow, sink)
            .await
    }

    /// Id of the first container whose name carries both the project and
    /// `role`. `Ok(None)` when nothing matches.
    pub async fn resolve_container(&self, role: &str) -> Result<Option<String>> {
        let project = self.project.name();
        Ok(self
            .status()
            .await?
            .into_iter()
            .find(|c| c.name.contains(project) && c.name.contains(role))
            .map(|c| c.id))
    }
}

#[async_trait]
impl<E: ContainerEngine> ContainerResolver for StackController<E> {
    fn project(&self) -> &str {
        self.project.name()
    }

    async fn resolve_container(&self, role: &str) -> Result<Option<String>> {
        StackController::resolve_container(self, role).await
    }
}
