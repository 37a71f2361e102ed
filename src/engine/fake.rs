//! In-memory [`ContainerEngine`] used by unit tests.
//!
//! Records every call so tests can assert which engine requests were (or
//! were not) issued.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::DuplexStream;

use super::{
    BuildRequest, ContainerEngine, ContainerSpec, ContainerStatus, EngineError, EngineResult,
    ExecOptions, ExecStream, LABEL_CONFIG_HASH, LABEL_PROJECT, LABEL_SERVICE, NetworkSpec,
    OutputChunk, OutputStream, ProgressMessage, ProgressStream, PublishedPort, RegistryAuth,
    VolumeSpec,
};

pub(crate) struct FakeContainer {
    pub project: String,
    pub status: ContainerStatus,
    pub spec: ContainerSpec,
}

#[derive(Clone)]
pub(crate) struct FakeImage {
    pub id: String,
    pub labels: HashMap<String, String>,
}

#[derive(Default)]
pub(crate) struct FakeState {
    pub containers: Vec<FakeContainer>,
    /// (name, project)
    pub networks: Vec<(String, String)>,
    /// (name, project)
    pub volumes: Vec<(String, String)>,
    /// keyed by `repository:tag`
    pub images: HashMap<String, FakeImage>,
    pub calls: Vec<String>,
    pub stop_timeouts: Vec<Duration>,
    pub logs: HashMap<String, Vec<OutputChunk>>,
    pub build_output: Vec<String>,
    pub fail_build: Option<String>,
    pub fail_push: Option<String>,
    pub fail_create: Option<String>,
    pub fail_exec_create: bool,
    pub fail_remove_image: bool,
    pub unreachable: bool,
    pub exec_output: Vec<OutputChunk>,
    pub exec_exit_code: Option<i64>,
    /// Remote ends of exec stdin, in start order.
    pub exec_inputs: Vec<DuplexStream>,
    pub last_build: Option<BuildRequest>,
    pub last_push_auth: Option<RegistryAuth>,
    pub last_exec: Option<(String, ExecOptions)>,
    next_id: u64,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:04}", prefix, self.next_id)
    }
}

#[derive(Default)]
pub(crate) struct FakeEngine {
    pub state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    /// Add a container directly, bypassing `create_container`.
    pub fn seed_container(&self, project: &str, service: &str, state: &str) -> String {
        let mut st = self.state.lock().unwrap();
        let id = st.next_id("c");
        let name = format!("{}-{}-1", project, service);
        st.containers.push(FakeContainer {
            project: project.to_string(),
            status: ContainerStatus {
                id: id.clone(),
                name: name.clone(),
                service: Some(service.to_string()),
                state: state.to_string(),
                ports: vec![],
                config_hash: None,
                image_id: None,
            },
            spec: ContainerSpec {
                name,
                ..Default::default()
            },
        });
        id
    }

    pub fn add_image(&self, reference: &str, labels: &[(&str, &str)]) -> String {
        let mut st = self.state.lock().unwrap();
        let id = st.next_id("sha256:");
        st.images.insert(
            reference.to_string(),
            FakeImage {
                id: id.clone(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        );
        id
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.state.lock().unwrap().images.contains_key(reference)
    }

    fn record(&self, call: String) -> EngineResult<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(call);
        if st.unreachable {
            return Err(EngineError::Connect("daemon not running".into()));
        }
        Ok(())
    }

    fn container_mut<'a>(st: &'a mut FakeState, id: &str) -> EngineResult<&'a mut FakeContainer> {
        st.containers
            .iter_mut()
            .find(|c| c.status.id == id)
            .ok_or_else(|| EngineError::Api {
                status: 404,
                message: format!("No such container: {}", id),
            })
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list_containers(&self, project: &str) -> EngineResult<Vec<ContainerStatus>> {
        self.record(format!("list_containers:{}", project))?;
        let st = self.state.lock().unwrap();
        Ok(st
            .containers
            .iter()
            .filter(|c| c.project == project)
            .map(|c| c.status.clone())
            .collect())
    }

    async fn list_networks(&self, project: &str) -> EngineResult<Vec<String>> {
        self.record(format!("list_networks:{}", project))?;
        let st = self.state.lock().unwrap();
        Ok(st
            .networks
            .iter()
            .filter(|(_, p)| p == project)
            .map(|(n, _)| n.clone())
            .collect())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> EngineResult<()> {
        self.record(format!("create_network:{}", spec.name))?;
        let mut st = self.state.lock().unwrap();
        let project = spec.labels.get(LABEL_PROJECT).cloned().unwrap_or_default();
        if !st.networks.iter().any(|(n, _)| n == &spec.name) {
            st.networks.push((spec.name.clone(), project));
        }
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> EngineResult<()> {
        self.record(format!("remove_network:{}", name))?;
        self.state.lock().unwrap().networks.retain(|(n, _)| n != name);
        Ok(())
    }

    async fn list_volumes(&self, project: &str) -> EngineResult<Vec<String>> {
        self.record(format!("list_volumes:{}", project))?;
        let st = self.state.lock().unwrap();
        Ok(st
            .volumes
            .iter()
            .filter(|(_, p)| p == project)
            .map(|(n, _)| n.clone())
            .collect())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> EngineResult<()> {
        self.record(format!("create_volume:{}", spec.name))?;
        let mut st = self.state.lock().unwrap();
        let project = spec.labels.get(LABEL_PROJECT).cloned().unwrap_or_default();
        if !st.volumes.iter().any(|(n, _)| n == &spec.name) {
            st.volumes.push((spec.name.clone(), project));
        }
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> EngineResult<()> {
        self.record(format!("remove_volume:{}", name))?;
        self.state.lock().unwrap().volumes.retain(|(n, _)| n != name);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        self.record(format!("create_container:{}", spec.name))?;
        let mut st = self.state.lock().unwrap();
        if let Some(message) = st.fail_create.clone() {
            return Err(EngineError::Api {
                status: 500,
                message,
            });
        }
        let id = st.next_id("c");
        let image_id = st.images.get(&spec.image).map(|image| image.id.clone());
        let ports = spec
            .ports
            .iter()
            .map(|p| PublishedPort {
                private_port: p.container_port,
                public_port: p.host_port.as_deref().and_then(|h| h.parse().ok()),
                protocol: p.protocol.clone(),
            })
            .collect();
        st.containers.push(FakeContainer {
            project: spec.labels.get(LABEL_PROJECT).cloned().unwrap_or_default(),
            status: ContainerStatus {
                id: id.clone(),
                name: spec.name.clone(),
                service: spec.labels.get(LABEL_SERVICE).cloned(),
                state: "Created".into(),
                ports,
                config_hash: spec.labels.get(LABEL_CONFIG_HASH).cloned(),
                image_id,
            },
            spec: spec.clone(),
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.record(format!("start_container:{}", id))?;
        let mut st = self.state.lock().unwrap();
        Self::container_mut(&mut st, id)?.status.state = "Up 1 second".into();
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> EngineResult<()> {
        self.record(format!("stop_container:{}", id))?;
        let mut st = self.state.lock().unwrap();
        st.stop_timeouts.push(timeout);
        Self::container_mut(&mut st, id)?.status.state = "Exited (0) 1 second ago".into();
        Ok(())
    }

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> EngineResult<()> {
        self.record(format!("remove_container:{}:{}", id, remove_volumes))?;
        let mut st = self.state.lock().unwrap();
        Self::container_mut(&mut st, id)?;
        st.containers.retain(|c| c.status.id != id);
        Ok(())
    }

    fn container_logs(&self, id: &str, follow: bool) -> OutputStream {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("container_logs:{}:{}", id, follow));
        let name = st
            .containers
            .iter()
            .find(|c| c.status.id == id)
            .map(|c| c.status.name.clone())
            .unwrap_or_default();
        let chunks = st.logs.get(&name).cloned().unwrap_or_default();
        futures::stream::iter(chunks.into_iter().map(Ok)).boxed()
    }

    fn build_image(&self, request: BuildRequest) -> ProgressStream {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("build_image:{}", request.tag));
        let mut items: Vec<EngineResult<ProgressMessage>> = st
            .build_output
            .iter()
            .map(|line| Ok(ProgressMessage::text(line.clone())))
            .collect();
        match st.fail_build.clone() {
            Some(message) => items.push(Err(EngineError::Stream(message))),
            None => {
                let id = st.next_id("sha256:");
                st.images.insert(
                    request.tag.clone(),
                    FakeImage {
                        id,
                        labels: HashMap::new(),
                    },
                );
            }
        }
        st.last_build = Some(request);
        futures::stream::iter(items).boxed()
    }

    async fn tag_image(&self, source: &str, repository: &str, tag: &str) -> EngineResult<()> {
        self.record(format!("tag_image:{}:{}:{}", source, repository, tag))?;
        let mut st = self.state.lock().unwrap();
        let image = st.images.get(source).cloned().ok_or_else(|| EngineError::Api {
            status: 404,
            message: format!("No such image: {}", source),
        })?;
        st.images.insert(format!("{}:{}", repository, tag), image);
        Ok(())
    }

    fn push_image(&self, repository: &str, tag: &str, auth: RegistryAuth) -> ProgressStream {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("push_image:{}:{}", repository, tag));
        st.last_push_auth = Some(auth);
        let mut items = vec![Ok(ProgressMessage {
            id: Some("layer1".into()),
            text: "Pushing".into(),
        })];
        match st.fail_push.clone() {
            Some(message) => items.push(Err(EngineError::Stream(message))),
            None => items.push(Ok(ProgressMessage {
                id: Some("layer1".into()),
                text: "Pushed".into(),
            })),
        }
        futures::stream::iter(items).boxed()
    }

    async fn remove_image(&self, reference: &str) -> EngineResult<()> {
        self.record(format!("remove_image:{}", reference))?;
        let mut st = self.state.lock().unwrap();
        if st.fail_remove_image {
            return Err(EngineError::Api {
                status: 409,
                message: "image is being used".into(),
            });
        }
        st.images.remove(reference).map(|_| ()).ok_or(EngineError::Api {
            status: 404,
            message: format!("No such image: {}", reference),
        })
    }

    async fn find_images(&self, reference: &str) -> EngineResult<Vec<String>> {
        self.record(format!("find_images:{}", reference))?;
        let st = self.state.lock().unwrap();
        Ok(st.images.get(reference).map(|i| i.id.clone()).into_iter().collect())
    }

    async fn image_labels(&self, image_id: &str) -> EngineResult<HashMap<String, String>> {
        self.record(format!("image_labels:{}", image_id))?;
        let st = self.state.lock().unwrap();
        st.images
            .values()
            .find(|i| i.id == image_id)
            .map(|i| i.labels.clone())
            .ok_or_else(|| EngineError::Api {
                status: 404,
                message: format!("No such image: {}", image_id),
            })
    }

    async fn create_exec(&self, container_id: &str, options: &ExecOptions) -> EngineResult<String> {
        self.record(format!("create_exec:{}", container_id))?;
        let mut st = self.state.lock().unwrap();
        if st.fail_exec_create {
            return Err(EngineError::Api {
                status: 409,
                message: format!("Container {} is not running", container_id),
            });
        }
        st.last_exec = Some((container_id.to_string(), options.clone()));
        Ok(st.next_id("exec"))
    }

    async fn start_exec(&self, exec_id: &str) -> EngineResult<ExecStream> {
        self.record(format!("start_exec:{}", exec_id))?;
        let mut st = self.state.lock().unwrap();
        let (local, remote) = tokio::io::duplex(64 * 1024);
        st.exec_inputs.push(remote);
        let output = st.exec_output.clone();
        Ok(ExecStream {
            output: futures::stream::iter(output.into_iter().map(Ok)).boxed(),
            input: Box::pin(local),
        })
    }

    async fn exec_exit_code(&self, exec_id: &str) -> EngineResult<Option<i64>> {
        self.record(format!("exec_exit_code:{}", exec_id))?;
        Ok(self.state.lock().unwrap().exec_exit_code)
    }
}
