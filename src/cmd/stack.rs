//! Stack lifecycle commands: start, stop, kill, ps, logs and run.

use anyhow::{Result, bail};
use console::style;
use std::path::Path;
use std::sync::Arc;

use flowstack::errors::StackError;
use flowstack::exec::{ExecBridge, ExecIo};
use flowstack::handler::{ContainerHandler, LocalStack};
use flowstack::stack::StackController;
use flowstack::ui::icons::{BROOM, CHECK, ROCKET, STOP};
use flowstack::ui::{endpoint_lines, render_status_table};

use super::Session;

fn handler(session: &Session, env_file: Option<&str>) -> LocalStack<flowstack::engine::DockerEngine> {
    let mut stack = StackController::new(
        Arc::clone(&session.engine),
        session.project.clone(),
        &session.settings,
    );
    if let Some(env_file) = env_file {
        stack = stack.with_env_file(env_file);
    }
    LocalStack::from_parts(stack, ExecBridge::new(Arc::clone(&session.engine)), &session.settings)
}

pub async fn cmd_start(project_dir: &Path, env_file: Option<&str>, no_cache: bool) -> Result<()> {
    let session = Session::open(project_dir).await?;
    let handler = handler(&session, env_file);

    println!("{}Starting project {}", ROCKET, style(&session.project).bold());
    let endpoints = handler.start(no_cache, &mut std::io::stdout()).await?;

    println!();
    println!("{}Project is running", CHECK);
    for line in endpoint_lines(&endpoints) {
        println!("{}", line);
    }
    Ok(())
}

pub async fn cmd_stop(project_dir: &Path) -> Result<()> {
    let session = Session::open(project_dir).await?;
    handler(&session, None).stop().await?;
    println!("{}Project {} stopped", STOP, style(&session.project).bold());
    Ok(())
}

pub async fn cmd_kill(project_dir: &Path) -> Result<()> {
    let session = Session::open(project_dir).await?;
    handler(&session, None).kill().await?;
    println!("{}Project {} removed", BROOM, style(&session.project).bold());
    Ok(())
}

pub async fn cmd_ps(project_dir: &Path) -> Result<()> {
    let session = Session::open(project_dir).await?;
    let statuses = handler(&session, None).ps().await?;
    print!("{}", render_status_table(&statuses));
    Ok(())
}

/// Which services `logs` narrows to. Nothing selected means every service.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSelection {
    pub webserver: bool,
    pub scheduler: bool,
    pub triggerer: bool,
}

impl LogSelection {
    fn services(&self, settings: &flowstack::config::Settings) -> Vec<String> {
        [
            (self.webserver, &settings.webserver_container_name),
            (self.scheduler, &settings.scheduler_container_name),
            (self.triggerer, &settings.triggerer_container_name),
        ]
        .into_iter()
        .filter(|(selected, _)| *selected)
        .map(|(_, name)| name.clone())
        .collect()
    }
}

pub async fn cmd_logs(project_dir: &Path, follow: bool, selection: LogSelection) -> Result<()> {
    let session = Session::open(project_dir).await?;
    let services = selection.services(&session.settings);
    handler(&session, None)
        .logs(follow, &services, &mut std::io::stdout())
        .await?;
    Ok(())
}

pub async fn cmd_run(project_dir: &Path, args: &[String], user: Option<&str>) -> Result<()> {
    let session = Session::open(project_dir).await?;
    match handler(&session, None).run(args, user, ExecIo::terminal()).await {
        Err(err @ StackError::NotRunning { .. }) => {
            bail!("{}. Start it with 'flowstack start'", err)
        }
        other => Ok(other?),
    }
}
