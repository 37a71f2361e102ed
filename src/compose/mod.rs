//! Compose definition builder.
//!
//! A [`StackDefinition`] is rendered fresh for every lifecycle call: the base
//! template for the project, merged with `docker-compose.override.yml` when one
//! sits in the project directory, then resolved into a [`ProjectPlan`] of
//! engine-level container, network and volume specs.

pub mod merge;
pub mod project;
pub mod resolve;
pub mod template;
pub mod types;

use tracing::debug;

pub use project::ComposeService;
pub use resolve::{ProjectPlan, ResolvedService};
pub use types::ComposeFile;

use crate::config::Settings;
use crate::errors::ComposeError;
use crate::project::ProjectIdentity;
use template::TemplateContext;

const BASE_DOCUMENT: &str = "docker-compose.yml";

/// The merged document for one project. Immutable once built.
#[derive(Debug, Clone)]
pub struct StackDefinition {
    project: ProjectIdentity,
    file: ComposeFile,
}

impl StackDefinition {
    /// Render the base template and apply the project's override file.
    ///
    /// `env_file` is relative to the project directory and is only referenced
    /// by the services when it exists.
    pub fn build(
        project: &ProjectIdentity,
        settings: &Settings,
        env_file: &str,
    ) -> Result<Self, ComposeError> {
        let env_file = project
            .dir()
            .join(env_file)
            .is_file()
            .then(|| env_file.to_string());

        let base = template::render(&TemplateContext {
            settings,
            image: format!("{}:latest", project.image_repository()),
            env_file,
        });

        let file = match merge::load_override(project.dir())? {
            Some(overlay) => {
                debug!(file = merge::OVERRIDE_FILE, "merging override document");
                let mut merged = serde_yaml::to_value(&base)
                    .map_err(|source| parse_error(BASE_DOCUMENT, source))?;
                merge::merge(&mut merged, overlay);
                serde_yaml::from_value(merged)
                    .map_err(|source| parse_error(merge::OVERRIDE_FILE, source))?
            }
            None => base,
        };

        Ok(Self {
            project: project.clone(),
            file,
        })
    }

    pub fn project(&self) -> &ProjectIdentity {
        &self.project
    }

    pub fn file(&self) -> &ComposeFile {
        &self.file
    }

    /// Resolve against the project directory and the process environment.
    pub fn plan(&self) -> Result<ProjectPlan, ComposeError> {
        self.plan_with(|key| std::env::var(key).ok())
    }

    pub fn plan_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<ProjectPlan, ComposeError> {
        resolve::resolve(self.project.name(), self.project.dir(), &self.file, lookup)
    }
}

fn parse_error(name: &str, source: serde_yaml::Error) -> ComposeError {
    ComposeError::Parse {
        name: name.to_string(),
        source,
    }
}
