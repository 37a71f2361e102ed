//! Image pipeline: build the runtime image, push it under an ephemeral
//! registry tag, read its labels.

pub mod context;
pub mod credentials;

use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use context::BuildContext;

use crate::engine::{BuildRequest, ContainerEngine, EngineError, ProgressMessage, ProgressStream};
use crate::errors::{Result, StackError};

/// Local tag reused across builds so the layer cache stays warm.
pub const STABLE_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    pub fn stable(repository: impl Into<String>) -> Self {
        Self::new(repository, STABLE_TAG)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Registry host for a cloud domain.
pub fn registry_for(domain: &str) -> String {
    format!("registry.{}", domain)
}

pub struct ImagePipeline<E: ContainerEngine> {
    engine: Arc<E>,
    repository: String,
    client_config: Option<PathBuf>,
}

impl<E: ContainerEngine> ImagePipeline<E> {
    pub fn new(engine: Arc<E>, repository: impl Into<String>) -> Self {
        Self {
            engine,
            repository: repository.into(),
            client_config: credentials::default_config_path(),
        }
    }

    /// Read registry credentials from `path` instead of the default client config.
    pub fn with_client_config(mut self, path: Option<PathBuf>) -> Self {
        self.client_config = path;
        self
    }

    pub fn stable_image(&self) -> ImageReference {
        ImageReference::stable(&self.repository)
    }

    /// Build the stable image from `context`, streaming progress into `out`.
    pub async fn build(&self, context: &BuildContext, out: &mut (dyn Write + Send)) -> Result<()> {
        let image = self.stable_image().to_string();
        let build_error = |source: EngineError| StackError::Build {
            image: image.clone(),
            source,
        };

        let dockerfile = context.dockerfile_path();
        if !dockerfile.is_file() {
            return Err(build_error(EngineError::Other(format!(
                "{} not found in {}",
                context.dockerfile,
                context.path.display()
            ))));
        }

        let payload = context::package(context).map_err(|e| build_error(EngineError::Io(e)))?;
        info!(%image, context = %context.path.display(), no_cache = context.no_cache, "building image");

        let progress = self.engine.build_image(BuildRequest {
            tag: image.clone(),
            dockerfile: context.dockerfile.clone(),
            no_cache: context.no_cache,
            context: payload,
        });
        drain_progress(progress, out).await.map_err(build_error)
    }

    /// Push the stable image as `registry.<domain>/<repository>:<remote_tag>`.
    ///
    /// The registry-qualified tag only exists for the duration of the call and
    /// is removed on every exit path.
    pub async fn push(
        &self,
        domain: &str,
        token: Option<&str>,
        remote_tag: &str,
        out: &mut (dyn Write + Send),
    ) -> Result<()> {
        let registry = registry_for(domain);
        let remote = ImageReference::new(format!("{}/{}", registry, self.repository), remote_tag);
        let remote_name = remote.to_string();

        self.engine
            .tag_image(&self.stable_image().to_string(), &remote.repository, &remote.tag)
            .await
            .map_err(|source| StackError::Push {
                image: remote_name.clone(),
                source,
            })?;

        let pushed = self.push_tagged(&registry, &remote, token, out).await;
        let cleanup = self.engine.remove_image(&remote_name).await;

        match (pushed, cleanup) {
            (Ok(()), Ok(())) => {
                info!(image = %remote_name, "pushed image");
                Ok(())
            }
            (Ok(()), Err(source)) => Err(StackError::Push {
                image: remote_name,
                source,
            }),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup_err)) => {
                warn!(image = %remote_name, error = %cleanup_err, "failed to remove push tag");
                Err(e)
            }
        }
    }

    async fn push_tagged(
        &self,
        registry: &str,
        remote: &ImageReference,
        token: Option<&str>,
        out: &mut (dyn Write + Send),
    ) -> Result<()> {
        let auth = credentials::resolve(self.client_config.as_deref(), registry, token)?;
        debug!(?auth, "resolved registry credentials");

        writeln!(out, "Pushing image to {}", registry)
            .map_err(StackError::io("error writing push output"))?;
        let progress = self.engine.push_image(&remote.repository, &remote.tag, auth);
        drain_progress(progress, out)
            .await
            .map_err(|source| StackError::Push {
                image: remote.to_string(),
                source,
            })
    }

    /// Labels of the stable image, verbatim.
    pub async fn labels(&self) -> Result<HashMap<String, String>> {
        let reference = self.stable_image().to_string();
        let ids = self
            .engine
            .find_images(&reference)
            .await
            .map_err(StackError::engine("error looking up image"))?;
        let Some(id) = ids.first() else {
            return Err(StackError::ImageNotFound { reference });
        };
        self.engine
            .image_labels(id)
            .await
            .map_err(StackError::engine("error inspecting image"))
    }
}

/// Copy progress lines to `out` as they arrive. Output already written stays
/// written when the stream fails.
async fn drain_progress(
    mut progress: ProgressStream,
    out: &mut (dyn Write + Send),
) -> std::result::Result<(), EngineError> {
    while let Some(message) = progress.next().await {
        let message = message?;
        write_progress(&message, out)?;
        out.flush()?;
    }
    Ok(())
}

fn write_progress(message: &ProgressMessage, out: &mut dyn Write) -> std::io::Result<()> {
    if message.text.is_empty() {
        return Ok(());
    }
    match &message.id {
        Some(id) => writeln!(out, "{}: {}", id, message.text.trim_end()),
        None if message.text.ends_with('\n') => out.write_all(message.text.as_bytes()),
        None => writeln!(out, "{}", message.text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use std::fs;

    const REPO: &str = "myproj_abc123/airflow";

    fn project_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM apache/airflow:2.7.0\n").unwrap();
        dir
    }

    fn pipeline(engine: &Arc<FakeEngine>) -> ImagePipeline<FakeEngine> {
        ImagePipeline::new(Arc::clone(engine), REPO).with_client_config(None)
    }

    #[tokio::test]
    async fn test_build_tags_stable_image_and_streams_output() {
        let dir = project_dir();
        let engine = Arc::new(FakeEngine::new());
        engine.state.lock().unwrap().build_output =
            vec!["Step 1/1 : FROM apache/airflow:2.7.0\n".into(), "Successfully built".into()];

        let mut out = Vec::new();
        pipeline(&engine)
            .build(&BuildContext::new(dir.path(), "Dockerfile", true), &mut out)
            .await
            .unwrap();

        assert!(engine.has_image(&format!("{}:latest", REPO)));
        let st = engine.state.lock().unwrap();
        let request = st.last_build.as_ref().unwrap();
        assert!(request.no_cache);
        assert_eq!(request.dockerfile, "Dockerfile");
        assert!(!request.context.is_empty());
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Step 1/1 : FROM apache/airflow:2.7.0\nSuccessfully built\n"
        );
    }

    #[tokio::test]
    async fn test_build_failure_keeps_partial_output() {
        let dir = project_dir();
        let engine = Arc::new(FakeEngine::new());
        {
            let mut st = engine.state.lock().unwrap();
            st.build_output = vec!["Step 1/2 : FROM x\n".into()];
            st.fail_build = Some("manifest unknown".into());
        }

        let mut out = Vec::new();
        let err = pipeline(&engine)
            .build(&BuildContext::new(dir.path(), "Dockerfile", false), &mut out)
            .await
            .unwrap_err();

        assert!(matches!(err, StackError::Build { .. }));
        assert!(err.to_string().contains("manifest unknown"));
        assert_eq!(String::from_utf8(out).unwrap(), "Step 1/2 : FROM x\n");
    }

    #[tokio::test]
    async fn test_build_missing_dockerfile_never_reaches_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let err = pipeline(&engine)
            .build(&BuildContext::new(dir.path(), "Dockerfile", false), &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::Build { .. }));
        assert!(!engine.called("build_image"));
    }

    #[tokio::test]
    async fn test_push_removes_ephemeral_tag_after_success() {
        let engine = Arc::new(FakeEngine::new());
        engine.add_image(&format!("{}:latest", REPO), &[]);

        let mut out = Vec::new();
        pipeline(&engine)
            .push("example.io", Some("tok"), "deploy-1", &mut out)
            .await
            .unwrap();

        let remote = format!("registry.example.io/{}:deploy-1", REPO);
        assert!(!engine.has_image(&remote));
        assert!(engine.has_image(&format!("{}:latest", REPO)));
        assert!(engine.called(&format!("push_image:registry.example.io/{}:deploy-1", REPO)));
        let st = engine.state.lock().unwrap();
        let auth = st.last_push_auth.as_ref().unwrap();
        assert_eq!(auth.password.as_deref(), Some("tok"));
        assert_eq!(auth.server_address, "registry.example.io");
        assert!(String::from_utf8(out.clone()).unwrap().contains("layer1: Pushed"));
    }

    #[tokio::test]
    async fn test_push_failure_still_removes_tag() {
        let engine = Arc::new(FakeEngine::new());
        engine.add_image(&format!("{}:latest", REPO), &[]);
        engine.state.lock().unwrap().fail_push = Some("denied: unauthorized".into());

        let err = pipeline(&engine)
            .push("example.io", Some("bad"), "deploy-2", &mut Vec::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StackError::Push { .. }));
        assert!(err.to_string().contains("unauthorized"));
        assert!(engine.called(&format!("remove_image:registry.example.io/{}:deploy-2", REPO)));
        assert!(!engine.has_image(&format!("registry.example.io/{}:deploy-2", REPO)));
    }

    #[tokio::test]
    async fn test_push_cleanup_failure_after_success_is_push_error() {
        let engine = Arc::new(FakeEngine::new());
        engine.add_image(&format!("{}:latest", REPO), &[]);
        engine.state.lock().unwrap().fail_remove_image = true;

        let err = pipeline(&engine)
            .push("example.io", None, "deploy-3", &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::Push { .. }));
    }

    #[tokio::test]
    async fn test_push_without_built_image_fails_before_push() {
        let engine = Arc::new(FakeEngine::new());
        let err = pipeline(&engine)
            .push("example.io", Some("tok"), "deploy-4", &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::Push { .. }));
        assert!(!engine.called("push_image"));
    }

    #[tokio::test]
    async fn test_labels_returns_label_set() {
        let engine = Arc::new(FakeEngine::new());
        engine.add_image(
            &format!("{}:latest", REPO),
            &[("io.astronomer.docker.airflow.version", "2.7.0")],
        );
        let labels = pipeline(&engine).labels().await.unwrap();
        assert_eq!(labels["io.astronomer.docker.airflow.version"], "2.7.0");
    }

    #[tokio::test]
    async fn test_labels_missing_image_is_not_found() {
        let engine = Arc::new(FakeEngine::new());
        let err = pipeline(&engine).labels().await.unwrap_err();
        assert!(matches!(err, StackError::ImageNotFound { ref reference } if reference == &format!("{}:latest", REPO)));
        assert!(!engine.called("image_labels"));
    }

    #[test]
    fn test_image_reference_display() {
        assert_eq!(ImageReference::stable("p/airflow").to_string(), "p/airflow:latest");
        assert_eq!(registry_for("example.io"), "registry.example.io");
    }
}
