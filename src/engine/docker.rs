//! bollard-backed [`ContainerEngine`] talking to the local daemon.

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{
    BuildInfo, ContainerCreateBody, ContainerSummary, EndpointSettings, HostConfig, NetworkCreateRequest,
    NetworkingConfig, PortBinding, PushImageInfo, RestartPolicy, RestartPolicyNameEnum, VolumeCreateOptions as VolumeCreateRequest,
};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, ListContainersOptionsBuilder,
    ListImagesOptionsBuilder, ListNetworksOptionsBuilder, ListVolumesOptionsBuilder,
    LogsOptionsBuilder, PushImageOptionsBuilder, RemoveContainerOptionsBuilder,
    RemoveImageOptions, RemoveVolumeOptions, StartContainerOptions, StopContainerOptionsBuilder,
    TagImageOptionsBuilder,
};
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{
    BuildRequest, ContainerEngine, ContainerSpec, ContainerStatus, EngineError, EngineResult,
    ExecOptions, ExecStream, LABEL_CONFIG_HASH, LABEL_PROJECT, LABEL_SERVICE, NetworkSpec,
    OutputChunk, OutputStream, ProgressMessage, ProgressStream, PublishedPort, RegistryAuth,
    VolumeSpec,
};

impl From<BollardError> for EngineError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => EngineError::Api {
                status: status_code,
                message,
            },
            BollardError::DockerStreamError { error } => EngineError::Stream(error),
            BollardError::IOError { err } => EngineError::Io(err),
            other => EngineError::Other(other.to_string()),
        }
    }
}

/// Engine client bound to the daemon's default local connection
/// (`DOCKER_HOST` or the platform socket).
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect with local defaults and verify the daemon answers.
    pub async fn connect() -> EngineResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Connect(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| EngineError::Connect(e.to_string()))?;
        debug!("connected to container engine");
        Ok(Self { docker })
    }

    fn project_filter(project: &str) -> HashMap<&'static str, Vec<String>> {
        HashMap::from([("label", vec![format!("{}={}", LABEL_PROJECT, project)])])
    }
}

fn to_status(summary: ContainerSummary) -> ContainerStatus {
    let labels = summary.labels.unwrap_or_default();
    let name = summary
        .names
        .and_then(|names| names.into_iter().next())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let ports = summary
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|p| PublishedPort {
            private_port: p.private_port,
            public_port: p.public_port,
            protocol: p
                .typ
                .map(|t| t.to_string())
                .unwrap_or_else(|| "tcp".to_string()),
        })
        .collect();

    ContainerStatus {
        id: summary.id.unwrap_or_default(),
        name,
        service: labels.get(LABEL_SERVICE).cloned(),
        state: summary.status.unwrap_or_default(),
        ports,
        config_hash: labels.get(LABEL_CONFIG_HASH).cloned(),
        image_id: summary.image_id,
    }
}

fn to_chunk(output: LogOutput) -> OutputChunk {
    match output {
        LogOutput::StdOut { message } => OutputChunk::StdOut(message.to_vec()),
        LogOutput::StdErr { message } => OutputChunk::StdErr(message.to_vec()),
        LogOutput::Console { message } | LogOutput::StdIn { message } => {
            OutputChunk::Console(message.to_vec())
        }
    }
}

/// Fields shared by build and push progress records.
#[derive(Debug, Default)]
struct ProgressRecord {
    id: Option<String>,
    stream: Option<String>,
    status: Option<String>,
    progress: Option<String>,
    error: Option<String>,
}

impl From<BuildInfo> for ProgressRecord {
    fn from(info: BuildInfo) -> Self {
        Self {
            id: info.id,
            stream: info.stream,
            status: info.status,
            progress: info.progress,
            error: info.error_detail.and_then(|d| d.message).or(info.error),
        }
    }
}

impl From<PushImageInfo> for ProgressRecord {
    fn from(info: PushImageInfo) -> Self {
        Self {
            status: info.status,
            progress: info.progress,
            error: info.error_detail.and_then(|d| d.message).or(info.error),
            ..Default::default()
        }
    }
}

/// Convert a progress record into a message, surfacing any error the daemon
/// embedded in the stream.
fn to_progress(record: ProgressRecord) -> EngineResult<ProgressMessage> {
    if let Some(message) = record.error {
        return Err(EngineError::Stream(message));
    }

    let text = match (record.stream, record.status, record.progress) {
        (Some(stream), _, _) => stream,
        (None, Some(status), Some(progress)) => format!("{} {}", status, progress),
        (None, Some(status), None) => status,
        _ => String::new(),
    };

    Ok(ProgressMessage {
        id: record.id,
        text,
    })
}

/// Drain a daemon stream into `tx`, converting each item. Stops after the
/// first error or once the receiver is gone.
async fn forward<T, I>(
    items: impl Stream<Item = Result<I, BollardError>>,
    tx: mpsc::UnboundedSender<EngineResult<T>>,
    convert: impl Fn(I) -> EngineResult<T>,
) {
    let mut items = std::pin::pin!(items);
    while let Some(item) = items.next().await {
        let item = item.map_err(EngineError::from).and_then(&convert);
        let failed = item.is_err();
        if tx.unbounded_send(item).is_err() || failed {
            break;
        }
    }
}

fn restart_policy(name: &str) -> Option<RestartPolicyNameEnum> {
    match name {
        "no" => Some(RestartPolicyNameEnum::NO),
        "always" => Some(RestartPolicyNameEnum::ALWAYS),
        "unless-stopped" => Some(RestartPolicyNameEnum::UNLESS_STOPPED),
        "on-failure" => Some(RestartPolicyNameEnum::ON_FAILURE),
        _ => None,
    }
}

fn port_bindings(spec: &ContainerSpec) -> HashMap<String, Option<Vec<PortBinding>>> {
    let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for port in &spec.ports {
        let binding = PortBinding {
            host_ip: port.host_ip.clone(),
            host_port: port.host_port.clone(),
        };
        bindings
            .entry(port.container_key())
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(binding);
    }
    bindings
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_containers(&self, project: &str) -> EngineResult<Vec<ContainerStatus>> {
        let filters = Self::project_filter(project);
        let options = ListContainersOptionsBuilder::default()
            .all(true)
            .filters(&filters)
            .build();
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().map(to_status).collect())
    }

    async fn list_networks(&self, project: &str) -> EngineResult<Vec<String>> {
        let filters = Self::project_filter(project);
        let options = ListNetworksOptionsBuilder::default()
            .filters(&filters)
            .build();
        let networks = self.docker.list_networks(Some(options)).await?;
        Ok(networks.into_iter().filter_map(|n| n.name).collect())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> EngineResult<()> {
        debug!(network = %spec.name, "creating network");
        let request = NetworkCreateRequest {
            name: spec.name.clone(),
            driver: spec.driver.clone(),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        };
        match self.docker.create_network(request).await {
            Ok(_) => Ok(()),
            Err(err) => match EngineError::from(err) {
                e if e.is_conflict() => Ok(()),
                e => Err(e),
            },
        }
    }

    async fn remove_network(&self, name: &str) -> EngineResult<()> {
        debug!(network = %name, "removing network");
        self.docker.remove_network(name).await?;
        Ok(())
    }

    async fn list_volumes(&self, project: &str) -> EngineResult<Vec<String>> {
        let filters = Self::project_filter(project);
        let options = ListVolumesOptionsBuilder::default()
            .filters(&filters)
            .build();
        let response = self.docker.list_volumes(Some(options)).await?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| v.name)
            .collect())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> EngineResult<()> {
        debug!(volume = %spec.name, "creating volume");
        let request = VolumeCreateRequest {
            name: Some(spec.name.clone()),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        };
        self.docker.create_volume(request).await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> EngineResult<()> {
        debug!(volume = %name, "removing volume");
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        debug!(container = %spec.name, image = %spec.image, "creating container");
        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            port_bindings: (!spec.ports.is_empty()).then(|| port_bindings(spec)),
            restart_policy: spec
                .restart
                .as_deref()
                .and_then(restart_policy)
                .map(|name| RestartPolicy {
                    name: Some(name),
                    ..Default::default()
                }),
            network_mode: spec.network.clone(),
            ..Default::default()
        };
        let networking_config = spec.network.as_ref().map(|network| NetworkingConfig {
            endpoints_config: Some(HashMap::from([(
                network.clone(),
                EndpointSettings {
                    aliases: Some(spec.aliases.clone()),
                    ..Default::default()
                },
            )])),
        });
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            entrypoint: spec.entrypoint.clone(),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            user: spec.user.clone(),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };
        let options = CreateContainerOptionsBuilder::default()
            .name(&spec.name)
            .build();
        let response = self.docker.create_container(Some(options), body).await?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions>)
            .await
        {
            // 304: already started
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            other => other.map_err(EngineError::from),
        }
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> EngineResult<()> {
        let options = StopContainerOptionsBuilder::default()
            .t(timeout.as_secs() as i32)
            .build();
        match self.docker.stop_container(id, Some(options)).await {
            // 304: already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            other => other.map_err(EngineError::from),
        }
    }

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> EngineResult<()> {
        let options = RemoveContainerOptionsBuilder::default()
            .force(true)
            .v(remove_volumes)
            .build();
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    fn container_logs(&self, id: &str, follow: bool) -> OutputStream {
        let options = LogsOptionsBuilder::default()
            .follow(follow)
            .stdout(true)
            .stderr(true)
            .tail("all")
            .build();
        let docker = self.docker.clone();
        let id = id.to_string();
        let (tx, rx) = mpsc::unbounded();
        tokio::spawn(async move {
            forward(docker.logs(&id, Some(options)), tx, |output| Ok(to_chunk(output))).await;
        });
        rx.boxed()
    }

    fn build_image(&self, request: BuildRequest) -> ProgressStream {
        let options = BuildImageOptionsBuilder::default()
            .dockerfile(&request.dockerfile)
            .t(&request.tag)
            .rm(true)
            .nocache(request.no_cache)
            .build();
        let body = bollard::body_full(request.context.into());
        let docker = self.docker.clone();
        let (tx, rx) = mpsc::unbounded();
        tokio::spawn(async move {
            forward(docker.build_image(options, None, Some(body)), tx, |info| {
                to_progress(info.into())
            })
            .await;
        });
        rx.boxed()
    }

    async fn tag_image(&self, source: &str, repository: &str, tag: &str) -> EngineResult<()> {
        debug!(%source, %repository, %tag, "tagging image");
        let options = TagImageOptionsBuilder::default()
            .repo(repository)
            .tag(tag)
            .build();
        self.docker.tag_image(source, Some(options)).await?;
        Ok(())
    }

    fn push_image(&self, repository: &str, tag: &str, auth: RegistryAuth) -> ProgressStream {
        let options = PushImageOptionsBuilder::default().tag(tag).build();
        let credentials = DockerCredentials {
            username: auth.username,
            password: auth.password,
            serveraddress: Some(auth.server_address),
            ..Default::default()
        };
        let docker = self.docker.clone();
        let repository = repository.to_string();
        let (tx, rx) = mpsc::unbounded();
        tokio::spawn(async move {
            forward(
                docker.push_image(&repository, Some(options), Some(credentials)),
                tx,
                |info| to_progress(info.into()),
            )
            .await;
        });
        rx.boxed()
    }

    async fn remove_image(&self, reference: &str) -> EngineResult<()> {
        debug!(%reference, "removing image");
        self.docker
            .remove_image(reference, None::<RemoveImageOptions>, None)
            .await?;
        Ok(())
    }

    async fn find_images(&self, reference: &str) -> EngineResult<Vec<String>> {
        let filters = HashMap::from([("reference", vec![reference.to_string()])]);
        let options = ListImagesOptionsBuilder::default()
            .filters(&filters)
            .build();
        let images = self.docker.list_images(Some(options)).await?;
        Ok(images.into_iter().map(|image| image.id).collect())
    }

    async fn image_labels(&self, image_id: &str) -> EngineResult<HashMap<String, String>> {
        let inspect = self.docker.inspect_image(image_id).await?;
        Ok(inspect
            .config
            .and_then(|config| config.labels)
            .unwrap_or_default())
    }

    async fn create_exec(&self, container_id: &str, options: &ExecOptions) -> EngineResult<String> {
        let config = CreateExecOptions::<String> {
            attach_stdin: Some(options.attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(options.cmd.clone()),
            user: options.user.clone(),
            ..Default::default()
        };
        let created = self.docker.create_exec(container_id, config).await?;
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str) -> EngineResult<ExecStream> {
        let options = StartExecOptions {
            detach: false,
            ..Default::default()
        };
        match self.docker.start_exec(exec_id, Some(options)).await? {
            StartExecResults::Attached { output, input } => Ok(ExecStream {
                output: output
                    .map(|item| item.map(to_chunk).map_err(EngineError::from))
                    .boxed(),
                input,
            }),
            StartExecResults::Detached => Err(EngineError::Other(format!(
                "exec {} started detached, no stream to attach",
                exec_id
            ))),
        }
    }

    async fn exec_exit_code(&self, exec_id: &str) -> EngineResult<Option<i64>> {
        let inspect = self.docker.inspect_exec(exec_id).await?;
        Ok(inspect.exit_code)
    }
}
