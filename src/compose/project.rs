//! Compose lifecycle over the engine primitives.
//!
//! Containers, networks and volumes belong to a project through the
//! `com.docker.compose.project` label, so stacks created here are visible to
//! (and manageable by) the regular compose tooling as well.

use futures::StreamExt;
use futures::future;
use futures::stream::{self, select_all};
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::resolve::ProjectPlan;
use crate::engine::{ContainerEngine, ContainerStatus, EngineError};
use crate::errors::{Result, StackError};

pub const ERR_STATUS_CHECK: &str = "error checking if containers are running";
pub const ERR_RECREATE: &str = "error building, (re)creating or starting project containers";
pub const ERR_PAUSE: &str = "error pausing project containers";
pub const ERR_STOP: &str = "error stopping and removing containers";
pub const ERR_LOGS: &str = "error streaming container logs";

/// Project-scoped compose operations.
pub struct ComposeService<E: ContainerEngine> {
    engine: Arc<E>,
}

impl<E: ContainerEngine> Clone for ComposeService<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<E: ContainerEngine> ComposeService<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }

    /// All project containers, running or not.
    pub async fn ps(&self, project: &str) -> Result<Vec<ContainerStatus>> {
        self.engine
            .list_containers(project)
            .await
            .map_err(StackError::engine(ERR_STATUS_CHECK))
    }

    /// Create what is missing and start every service in dependency order.
    pub async fn up(&self, plan: &ProjectPlan) -> Result<()> {
        let engine = &self.engine;
        let existing = engine
            .list_containers(&plan.project)
            .await
            .map_err(StackError::engine(ERR_RECREATE))?;

        let known: HashSet<&str> = plan.service_names().into_iter().collect();
        for orphan in existing
            .iter()
            .filter(|c| c.service.as_deref().is_some_and(|s| !known.contains(s)))
        {
            warn!(
                container = %orphan.name,
                "found orphan container for this project; run kill to clean it up"
            );
        }

        let networks = engine
            .list_networks(&plan.project)
            .await
            .map_err(StackError::engine(ERR_RECREATE))?;
        for network in plan.networks.iter().filter(|n| !networks.contains(&n.name)) {
            debug!(network = %network.name, "creating network");
            engine
                .create_network(network)
                .await
                .map_err(StackError::engine(ERR_RECREATE))?;
        }

        let volumes = engine
            .list_volumes(&plan.project)
            .await
            .map_err(StackError::engine(ERR_RECREATE))?;
        for volume in plan.volumes.iter().filter(|v| !volumes.contains(&v.name)) {
            debug!(volume = %volume.name, "creating volume");
            engine
                .create_volume(volume)
                .await
                .map_err(StackError::engine(ERR_RECREATE))?;
        }

        for service in &plan.services {
            let current = existing.iter().find(|c| {
                c.service.as_deref() == Some(service.name.as_str())
                    || c.name == service.container.name
            });

            let image = engine
                .find_images(&service.container.image)
                .await
                .map_err(StackError::engine(ERR_RECREATE))?
                .into_iter()
                .next();

            let id = match current {
                Some(c)
                    if c.config_hash.as_deref() == service.config_hash()
                        && !image_changed(c, image.as_deref()) =>
                {
                    if c.is_up() {
                        debug!(service = %service.name, "container up to date");
                        continue;
                    }
                    c.id.clone()
                }
                Some(c) => {
                    info!(service = %service.name, "configuration or image changed, recreating container");
                    engine
                        .remove_container(&c.id, false)
                        .await
                        .map_err(StackError::engine(ERR_RECREATE))?;
                    self.create(service).await?
                }
                None => self.create(service).await?,
            };

            info!(service = %service.name, "starting container");
            engine
                .start_container(&id)
                .await
                .map_err(StackError::engine(ERR_RECREATE))?;
        }
        Ok(())
    }

    async fn create(&self, service: &super::ResolvedService) -> Result<String> {
        debug!(service = %service.name, container = %service.container.name, "creating container");
        self.engine
            .create_container(&service.container)
            .await
            .map_err(StackError::engine(ERR_RECREATE))
    }

    /// Stop running containers in reverse dependency order. Nothing is removed.
    pub async fn stop(&self, plan: &ProjectPlan, timeout: Duration) -> Result<()> {
        let mut running: Vec<ContainerStatus> = self
            .engine
            .list_containers(&plan.project)
            .await
            .map_err(StackError::engine(ERR_PAUSE))?
            .into_iter()
            .filter(ContainerStatus::is_up)
            .collect();

        // containers outside the plan go first, then dependents before dependencies
        running.sort_by_key(|c| {
            std::cmp::Reverse(
                c.service
                    .as_deref()
                    .and_then(|s| plan.services.iter().position(|r| r.name == s))
                    .unwrap_or(usize::MAX),
            )
        });

        for container in &running {
            info!(container = %container.name, timeout_secs = timeout.as_secs(), "stopping container");
            self.engine
                .stop_container(&container.id, timeout)
                .await
                .map_err(StackError::engine(ERR_PAUSE))?;
        }
        Ok(())
    }

    /// Remove every project container (orphans included), the project
    /// networks and, with `volumes`, the project volumes.
    pub async fn down(&self, project: &str, volumes: bool) -> Result<()> {
        let engine = &self.engine;
        let containers = engine
            .list_containers(project)
            .await
            .map_err(StackError::engine(ERR_STOP))?;
        for container in &containers {
            info!(container = %container.name, "removing container");
            tolerate_missing(engine.remove_container(&container.id, true).await)
                .map_err(StackError::engine(ERR_STOP))?;
        }

        for network in engine
            .list_networks(project)
            .await
            .map_err(StackError::engine(ERR_STOP))?
        {
            debug!(%network, "removing network");
            tolerate_missing(engine.remove_network(&network).await)
                .map_err(StackError::engine(ERR_STOP))?;
        }

        if volumes {
            for volume in engine
                .list_volumes(project)
                .await
                .map_err(StackError::engine(ERR_STOP))?
            {
                debug!(%volume, "removing volume");
                tolerate_missing(engine.remove_volume(&volume).await)
                    .map_err(StackError::engine(ERR_STOP))?;
            }
        }
        Ok(())
    }

    /// Write `service | line` for every log line of the selected services
    /// (all when `services` is empty) until the streams end.
    pub async fn logs(
        &self,
        project: &str,
        services: &[String],
        follow: bool,
        sink: &mut (dyn Write + Send),
    ) -> Result<()> {
        let containers = self.ps(project).await?;

        for wanted in services {
            if !containers.iter().any(|c| c.service.as_deref() == Some(wanted.as_str())) {
                return Err(StackError::NoSuchService(wanted.clone()));
            }
        }

        let selected: Vec<&ContainerStatus> = containers
            .iter()
            .filter(|c| {
                services.is_empty()
                    || c.service
                        .as_ref()
                        .is_some_and(|s| services.iter().any(|w| w == s))
            })
            .collect();

        let labels: Vec<String> = selected
            .iter()
            .map(|&c| c.service.clone().unwrap_or_else(|| c.name.clone()))
            .collect();
        let width = labels.iter().map(String::len).max().unwrap_or(0);
        let mut tails = vec![String::new(); selected.len()];

        // A `None` after each stream marks its end so a trailing partial line
        // can be flushed.
        let streams = selected.iter().enumerate().map(|(index, &c)| {
            self.engine
                .container_logs(&c.id, follow)
                .map(Some)
                .chain(stream::once(future::ready(None)))
                .map(move |item| (index, item))
                .boxed()
        });
        let mut merged = select_all(streams);

        while let Some((index, item)) = merged.next().await {
            let tail = &mut tails[index];
            match item {
                Some(item) => {
                    let chunk = item.map_err(StackError::engine(ERR_LOGS))?;
                    tail.push_str(&String::from_utf8_lossy(chunk.bytes()));
                    while let Some(end) = tail.find('\n') {
                        let line: String = tail.drain(..=end).collect();
                        write_log_line(sink, &labels[index], &line, width)?;
                    }
                }
                None if !tail.is_empty() => {
                    let line = std::mem::take(tail);
                    write_log_line(sink, &labels[index], &line, width)?;
                }
                None => {}
            }
        }
        sink.flush()
            .map_err(StackError::io("error writing container logs"))
    }
}

fn write_log_line(
    sink: &mut (dyn Write + Send),
    service: &str,
    line: &str,
    width: usize,
) -> Result<()> {
    let line = line.trim_end_matches(['\n', '\r']);
    writeln!(sink, "{:<width$} | {}", service, line, width = width)
        .map_err(StackError::io("error writing container logs"))
}

/// True when the container was created from a different image than the one
/// its reference currently points to.
fn image_changed(container: &ContainerStatus, current: Option<&str>) -> bool {
    match (container.image_id.as_deref(), current) {
        (Some(have), Some(want)) => have != want,
        _ => false,
    }
}

fn tolerate_missing(
    result: std::result::Result<(), EngineError>,
) -> std::result::Result<(), EngineError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
