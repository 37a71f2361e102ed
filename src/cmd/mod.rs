//! CLI command implementations.
//!
//! | Module  | Commands handled                                  |
//! |---------|---------------------------------------------------|
//! | `stack` | `Start`, `Stop`, `Kill`, `Ps`, `Logs`, `Run`      |
//! | `image` | `Build`, `Push`, `Labels`                         |

pub mod image;
pub mod stack;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use flowstack::config::Settings;
use flowstack::engine::DockerEngine;
use flowstack::project::ProjectIdentity;

pub use image::{cmd_build, cmd_labels, cmd_push};
pub use stack::{LogSelection, cmd_kill, cmd_logs, cmd_ps, cmd_run, cmd_start, cmd_stop};

/// Everything a command needs: daemon connection, settings and project identity.
pub struct Session {
    pub engine: Arc<DockerEngine>,
    pub settings: Settings,
    pub project: ProjectIdentity,
}

impl Session {
    pub async fn open(project_dir: &Path) -> Result<Self> {
        let settings = Settings::load(project_dir)?;
        let project = ProjectIdentity::derive(project_dir, settings.project_name.as_deref())?;
        let engine = DockerEngine::connect()
            .await
            .context("Is the container engine running?")?;
        Ok(Self {
            engine: Arc::new(engine),
            settings,
            project,
        })
    }
}
