//! Settings for the local stack.
//!
//! Read from `.flowstack/config.toml` in the project directory:
//!
//! ```toml
//! [project]
//! name = "analytics"
//!
//! [webserver]
//! port = "8080"
//! container_name = "webserver"
//!
//! [postgres]
//! port = "5432"
//! user = "postgres"
//! password = "postgres"
//!
//! [triggerer]
//! enabled = true
//!
//! [cloud]
//! domain = "example.io"
//! ```
//!
//! Missing file or keys fall back to [`Settings::default`]. A handful of keys can
//! also be overridden through `FLOWSTACK_*` environment variables.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

pub const CONFIG_DIR: &str = ".flowstack";
pub const CONFIG_FILE: &str = "config.toml";

/// Resolved settings handed to the stack controller, image pipeline and exec bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Explicit project name; the directory name is used when unset.
    pub project_name: Option<String>,
    /// Host side of the webserver port mapping, optionally `ip:port`.
    pub webserver_port: String,
    pub postgres_port: String,
    pub postgres_user: String,
    pub postgres_password: String,
    pub postgres_host: String,
    pub postgres_image: String,
    pub webserver_container_name: String,
    pub scheduler_container_name: String,
    pub triggerer_container_name: String,
    pub triggerer_enabled: bool,
    pub cloud_domain: Option<String>,
    pub env_file: String,
    pub dockerfile: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_name: None,
            webserver_port: "8080".to_string(),
            postgres_port: "5432".to_string(),
            postgres_user: "postgres".to_string(),
            postgres_password: "postgres".to_string(),
            postgres_host: "postgres".to_string(),
            postgres_image: "postgres:12.6".to_string(),
            webserver_container_name: "webserver".to_string(),
            scheduler_container_name: "scheduler".to_string(),
            triggerer_container_name: "triggerer".to_string(),
            triggerer_enabled: true,
            cloud_domain: None,
            env_file: ".env".to_string(),
            dockerfile: "Dockerfile".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsToml {
    #[serde(default)]
    project: ProjectSection,
    #[serde(default)]
    webserver: ContainerSection,
    #[serde(default)]
    scheduler: ContainerSection,
    #[serde(default)]
    triggerer: TriggererSection,
    #[serde(default)]
    postgres: PostgresSection,
    #[serde(default)]
    cloud: CloudSection,
}

#[derive(Debug, Default, Deserialize)]
struct ProjectSection {
    name: Option<String>,
    env_file: Option<String>,
    dockerfile: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerSection {
    port: Option<String>,
    container_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TriggererSection {
    enabled: Option<bool>,
    container_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PostgresSection {
    port: Option<String>,
    user: Option<String>,
    password: Option<String>,
    host: Option<String>,
    image: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CloudSection {
    domain: Option<String>,
}

impl Settings {
    /// Load settings for a project directory, then apply environment overrides.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut settings = Self::load_file(project_dir)?;
        settings.apply_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Load `.flowstack/config.toml` only. Returns defaults if the file doesn't exist.
    pub fn load_file(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let raw: SettingsToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let mut settings = Self::default();
        settings.merge(raw);
        Ok(settings)
    }

    fn merge(&mut self, raw: SettingsToml) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }

        if raw.project.name.is_some() {
            self.project_name = raw.project.name;
        }
        set(&mut self.env_file, raw.project.env_file);
        set(&mut self.dockerfile, raw.project.dockerfile);
        set(&mut self.webserver_port, raw.webserver.port);
        set(&mut self.webserver_container_name, raw.webserver.container_name);
        set(&mut self.scheduler_container_name, raw.scheduler.container_name);
        set(&mut self.triggerer_enabled, raw.triggerer.enabled);
        set(&mut self.triggerer_container_name, raw.triggerer.container_name);
        set(&mut self.postgres_port, raw.postgres.port);
        set(&mut self.postgres_user, raw.postgres.user);
        set(&mut self.postgres_password, raw.postgres.password);
        set(&mut self.postgres_host, raw.postgres.host);
        set(&mut self.postgres_image, raw.postgres.image);
        if raw.cloud.domain.is_some() {
            self.cloud_domain = raw.cloud.domain;
        }
    }

    /// Apply `FLOWSTACK_*` overrides from the given lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("FLOWSTACK_WEBSERVER_PORT") {
            self.webserver_port = port;
        }
        if let Some(port) = lookup("FLOWSTACK_POSTGRES_PORT") {
            self.postgres_port = port;
        }
        if let Some(domain) = lookup("FLOWSTACK_CLOUD_DOMAIN") {
            self.cloud_domain = Some(domain);
        }
    }

    /// Host port of the webserver link, dropping any `ip:` prefix.
    pub fn webserver_host_port(&self) -> &str {
        self.webserver_port
            .rsplit(':')
            .next()
            .unwrap_or(&self.webserver_port)
    }
}
