//! Resolution of a compose document into engine-level specs.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;

use super::types::{CommandSpec, ComposeFile, ServiceSpec};
use crate::engine::{
    ContainerSpec, LABEL_CONFIG_HASH, LABEL_CONTAINER_NUMBER, LABEL_NETWORK, LABEL_ONEOFF,
    LABEL_PROJECT, LABEL_SERVICE, LABEL_VOLUME, NetworkSpec, PortMapping, VolumeSpec,
};
use crate::errors::ComposeError;

pub const DEFAULT_NETWORK: &str = "default";

/// One service ready to hand to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedService {
    pub name: String,
    pub container: ContainerSpec,
    pub depends_on: Vec<String>,
}

impl ResolvedService {
    pub fn config_hash(&self) -> Option<&str> {
        self.container.labels.get(LABEL_CONFIG_HASH).map(String::as_str)
    }
}

/// Everything `up` needs for one project. Services are in dependency order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectPlan {
    pub project: String,
    pub services: Vec<ResolvedService>,
    pub networks: Vec<NetworkSpec>,
    pub volumes: Vec<VolumeSpec>,
}

impl ProjectPlan {
    pub fn service(&self, name: &str) -> Option<&ResolvedService> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Resolve `file` for `project`. Relative paths are taken from `working_dir`;
/// `lookup` supplies values for environment keys declared without one.
pub fn resolve(
    project: &str,
    working_dir: &Path,
    file: &ComposeFile,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ProjectPlan, ComposeError> {
    let order = dependency_order(file)?;

    let mut uses_default_network = false;
    let mut services = Vec::with_capacity(order.len());
    for name in order {
        let spec = &file.services[&name];
        let network = match spec.networks.names().first() {
            Some(network) => {
                if !file.networks.contains_key(*network) && *network != DEFAULT_NETWORK {
                    return Err(ComposeError::UnknownNetwork {
                        service: name.clone(),
                        network: network.to_string(),
                    });
                }
                network.to_string()
            }
            None => DEFAULT_NETWORK.to_string(),
        };
        if network == DEFAULT_NETWORK && !file.networks.contains_key(DEFAULT_NETWORK) {
            uses_default_network = true;
        }
        services.push(resolve_service(
            project,
            working_dir,
            file,
            &name,
            spec,
            &network,
            &lookup,
        )?);
    }

    let mut networks: Vec<NetworkSpec> = file
        .networks
        .iter()
        .map(|(name, def)| NetworkSpec {
            name: scoped(project, name),
            driver: def.as_ref().and_then(|d| d.driver.clone()),
            labels: resource_labels(project, LABEL_NETWORK, name),
        })
        .collect();
    if uses_default_network {
        networks.push(NetworkSpec {
            name: scoped(project, DEFAULT_NETWORK),
            driver: None,
            labels: resource_labels(project, LABEL_NETWORK, DEFAULT_NETWORK),
        });
    }

    let volumes = file
        .volumes
        .keys()
        .map(|name| VolumeSpec {
            name: scoped(project, name),
            labels: resource_labels(project, LABEL_VOLUME, name),
        })
        .collect();

    Ok(ProjectPlan {
        project: project.to_string(),
        services,
        networks,
        volumes,
    })
}

/// Project-scoped name of a network or volume.
pub fn scoped(project: &str, name: &str) -> String {
    format!("{}_{}", project, name)
}

fn resource_labels(project: &str, kind_label: &str, name: &str) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_PROJECT.to_string(), project.to_string()),
        (kind_label.to_string(), name.to_string()),
    ])
}

fn resolve_service(
    project: &str,
    working_dir: &Path,
    file: &ComposeFile,
    name: &str,
    spec: &ServiceSpec,
    network: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<ResolvedService, ComposeError> {
    let image = spec.image.clone().ok_or_else(|| ComposeError::MissingImage {
        service: name.to_string(),
    })?;

    let env = resolve_env(working_dir, spec, lookup)?;

    let ports = spec
        .ports
        .iter()
        .map(|entry| parse_port(name, &entry.to_string()))
        .collect::<Result<Vec<_>, _>>()?;

    let binds = spec
        .volumes
        .iter()
        .map(|entry| parse_volume(name, entry, project, working_dir, file))
        .collect::<Result<Vec<_>, _>>()?;

    let command = spec
        .command
        .as_ref()
        .map(|c| command_args(name, c))
        .transpose()?;
    let entrypoint = spec
        .entrypoint
        .as_ref()
        .map(|c| command_args(name, c))
        .transpose()?;

    let mut labels: HashMap<String, String> = spec
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.insert(LABEL_PROJECT.into(), project.into());
    labels.insert(LABEL_SERVICE.into(), name.into());
    labels.insert(LABEL_CONTAINER_NUMBER.into(), "1".into());
    labels.insert(LABEL_ONEOFF.into(), "False".into());
    labels.insert(LABEL_CONFIG_HASH.into(), config_hash(name, spec, &env)?);

    Ok(ResolvedService {
        name: name.to_string(),
        container: ContainerSpec {
            name: spec
                .container_name
                .clone()
                .unwrap_or_else(|| format!("{}-{}-1", project, name)),
            image,
            command,
            entrypoint,
            env,
            labels,
            ports,
            binds,
            network: Some(scoped(project, network)),
            aliases: vec![name.to_string()],
            restart: spec.restart.clone(),
            user: spec.user.clone(),
        },
        depends_on: spec.depends_on.names().into_iter().map(str::to_string).collect(),
    })
}

/// `KEY=VALUE` list: env files first (in order), then `environment`, sorted by key.
fn resolve_env(
    working_dir: &Path,
    spec: &ServiceSpec,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Vec<String>, ComposeError> {
    let mut merged = BTreeMap::new();
    for item in spec.env_file.items() {
        let path = working_dir.join(item);
        let iter = dotenvy::from_path_iter(&path).map_err(|source| ComposeError::EnvFile {
            path: path.clone(),
            source,
        })?;
        for pair in iter {
            let (key, value) = pair.map_err(|source| ComposeError::EnvFile {
                path: path.clone(),
                source,
            })?;
            merged.insert(key, value);
        }
    }
    merged.extend(spec.environment.to_map(lookup));
    Ok(merged
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect())
}

fn config_hash(name: &str, spec: &ServiceSpec, env: &[String]) -> Result<String, ComposeError> {
    let rendered = serde_yaml::to_string(spec).map_err(|source| ComposeError::Parse {
        name: name.to_string(),
        source,
    })?;
    let mut hasher = Sha256::new();
    hasher.update(rendered.as_bytes());
    for entry in env {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn command_args(service: &str, command: &CommandSpec) -> Result<Vec<String>, ComposeError> {
    match command {
        CommandSpec::Exec(args) => Ok(args.clone()),
        CommandSpec::Shell(line) => split_command(service, line),
    }
}

/// Split a command line the way a POSIX shell tokenises words: whitespace
/// separates, single quotes are literal, double quotes allow `\` escapes.
pub fn split_command(service: &str, line: &str) -> Result<Vec<String>, ComposeError> {
    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote = Quote::None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => {
                if c == '\'' {
                    quote = Quote::None;
                } else {
                    current.push(c);
                }
            }
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\' | '$' | '`')) => current.push(next),
                    Some(next) => {
                        current.push('\\');
                        current.push(next);
                    }
                    None => {
                        return Err(ComposeError::UnterminatedQuote {
                            service: service.to_string(),
                        });
                    }
                },
                _ => current.push(c),
            },
            Quote::None => match c {
                '\'' => {
                    quote = Quote::Single;
                    in_word = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_word = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        args.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote != Quote::None {
        return Err(ComposeError::UnterminatedQuote {
            service: service.to_string(),
        });
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

/// Parse `[[ip:]host:]container[/proto]`.
pub fn parse_port(service: &str, spec: &str) -> Result<PortMapping, ComposeError> {
    let invalid = || ComposeError::InvalidPort {
        service: service.to_string(),
        spec: spec.to_string(),
    };

    let (addr, protocol) = match spec.rsplit_once('/') {
        Some((addr, proto)) if matches!(proto, "tcp" | "udp" | "sctp") => (addr, proto),
        Some(_) => return Err(invalid()),
        None => (spec, "tcp"),
    };

    let parts: Vec<&str> = addr.split(':').collect();
    let (host_ip, host_port, container) = match parts.as_slice() {
        [container] => (None, None, *container),
        [host, container] => (None, Some(*host), *container),
        [ip, host, container] => (Some(*ip), Some(*host), *container),
        _ => return Err(invalid()),
    };

    let container_port: u16 = container.trim().parse().map_err(|_| invalid())?;
    if let Some(host) = host_port
        && !host.is_empty()
        && host.parse::<u16>().is_err()
    {
        return Err(invalid());
    }

    Ok(PortMapping {
        host_ip: host_ip.filter(|ip| !ip.is_empty()).map(str::to_string),
        host_port: host_port.filter(|h| !h.is_empty()).map(str::to_string),
        container_port,
        protocol: protocol.to_string(),
    })
}

/// Parse `source:target[:mode]` into an engine bind string.
///
/// Path sources (`.`, `/` or `~` prefixed) become absolute host paths; any
/// other source must be a declared named volume and is project-scoped.
pub fn parse_volume(
    service: &str,
    spec: &str,
    project: &str,
    working_dir: &Path,
    file: &ComposeFile,
) -> Result<String, ComposeError> {
    let invalid = || ComposeError::InvalidVolume {
        service: service.to_string(),
        spec: spec.to_string(),
    };

    let parts: Vec<&str> = spec.split(':').collect();
    let (source, target, mode) = match parts.as_slice() {
        [source, target] => (*source, *target, None),
        [source, target, mode] => (*source, *target, Some(*mode)),
        _ => return Err(invalid()),
    };
    if source.is_empty() || !target.starts_with('/') {
        return Err(invalid());
    }

    let source = if source.starts_with('.') || source.starts_with('/') {
        let path = working_dir.join(source.strip_prefix("./").unwrap_or(source));
        path.to_string_lossy().trim_end_matches("/.").to_string()
    } else if let Some(rest) = source.strip_prefix('~') {
        let home = dirs::home_dir().ok_or_else(invalid)?;
        home.join(rest.trim_start_matches('/'))
            .to_string_lossy()
            .to_string()
    } else if file.volumes.contains_key(source) {
        scoped(project, source)
    } else {
        return Err(invalid());
    };

    Ok(match mode {
        Some(mode) => format!("{}:{}:{}", source, target, mode),
        None => format!("{}:{}", source, target),
    })
}

/// Kahn's algorithm over `depends_on`; ties broken by service name.
fn dependency_order(file: &ComposeFile) -> Result<Vec<String>, ComposeError> {
    let mut indegree: BTreeMap<&str, usize> =
        file.services.keys().map(|k| (k.as_str(), 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (name, spec) in &file.services {
        for dep in spec.depends_on.names() {
            if !file.services.contains_key(dep) {
                return Err(ComposeError::UnknownDependency {
                    service: name.clone(),
                    dependency: dep.to_string(),
                });
            }
            *indegree.entry(name.as_str()).or_default() += 1;
            dependents.entry(dep).or_default().push(name.as_str());
        }
    }

    let mut ready: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut order = Vec::with_capacity(file.services.len());

    while let Some(name) = ready.pop_front() {
        order.push(name.to_string());
        let mut unlocked = BTreeSet::new();
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(dependent) {
                *d -= 1;
                if *d == 0 {
                    unlocked.insert(*dependent);
                }
            }
        }
        ready.extend(unlocked);
    }

    if order.len() != file.services.len() {
        let stuck: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(n, _)| *n)
            .collect();
        return Err(ComposeError::DependencyCycle(stuck.join(", ")));
    }
    Ok(order)
}
