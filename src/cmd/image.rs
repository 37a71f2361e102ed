//! Image commands: build, push and labels.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;
use std::sync::Arc;

use flowstack::engine::DockerEngine;
use flowstack::image::{BuildContext, ImagePipeline};
use flowstack::ui::icons::{CHECK, PACKAGE};

use super::Session;

fn pipeline(session: &Session) -> ImagePipeline<DockerEngine> {
    ImagePipeline::new(Arc::clone(&session.engine), session.project.image_repository())
}

pub async fn cmd_build(project_dir: &Path, no_cache: bool) -> Result<()> {
    let session = Session::open(project_dir).await?;
    let images = pipeline(&session);
    let context = BuildContext::new(
        session.project.dir(),
        &session.settings.dockerfile,
        no_cache,
    );

    println!("{}Building {}", PACKAGE, style(images.stable_image()).bold());
    images.build(&context, &mut std::io::stdout()).await?;
    println!("{}Built {}", CHECK, images.stable_image());
    Ok(())
}

pub async fn cmd_push(
    project_dir: &Path,
    tag: &str,
    domain: Option<&str>,
    token: Option<&str>,
) -> Result<()> {
    let session = Session::open(project_dir).await?;
    let Some(domain) = domain.or(session.settings.cloud_domain.as_deref()) else {
        bail!("No registry domain. Pass --domain or set [cloud] domain in .flowstack/config.toml");
    };

    let images = pipeline(&session);
    println!("{}Pushing {} to {}", PACKAGE, images.stable_image(), style(domain).bold());
    images
        .push(domain, token, tag, &mut std::io::stdout())
        .await
        .with_context(|| format!("Push to {} failed", domain))?;
    println!("{}Pushed tag {}", CHECK, tag);
    Ok(())
}

pub async fn cmd_labels(project_dir: &Path) -> Result<()> {
    let session = Session::open(project_dir).await?;
    let mut labels: Vec<_> = pipeline(&session).labels().await?.into_iter().collect();
    labels.sort();
    for (key, value) in labels {
        println!("{}={}", key, value);
    }
    Ok(())
}
