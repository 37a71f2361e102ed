//! Base stack template: database, scheduler, webserver and (optionally) triggerer.

use std::collections::BTreeMap;

use super::types::{
    CommandSpec, ComposeFile, Environment, NameList, NetworkDefinition, PortEntry, ServiceSpec,
    StringOrList,
};
use crate::config::Settings;

pub const NETWORK_NAME: &str = "airflow";
pub const POSTGRES_VOLUME: &str = "postgres_data";
pub const LOGS_VOLUME: &str = "airflow_logs";
pub const AIRFLOW_HOME: &str = "/usr/local/airflow";
pub const COMPONENT_LABEL: &str = "dev.flowstack.component";

const DEFAULT_FERNET_KEY: &str = "d6Vefz3G9U_ynXB3cr7y_Ak35tAHkEGAVxuz_B-jzWw=";

/// Inputs to the base template.
pub struct TemplateContext<'a> {
    pub settings: &'a Settings,
    /// `repository:tag` of the runtime image.
    pub image: String,
    /// Env file to reference, only when it exists on disk.
    pub env_file: Option<String>,
}

/// Render the base document for a project.
pub fn render(ctx: &TemplateContext<'_>) -> ComposeFile {
    let s = ctx.settings;
    let mut services = BTreeMap::new();

    services.insert(
        s.postgres_host.clone(),
        ServiceSpec {
            image: Some(s.postgres_image.clone()),
            restart: Some("unless-stopped".into()),
            networks: NameList::List(vec![NETWORK_NAME.into()]),
            labels: component_label("postgres"),
            ports: vec![PortEntry::Text(format!("{}:5432", s.postgres_port))],
            volumes: vec![format!("{}:/var/lib/postgresql/data", POSTGRES_VOLUME)],
            environment: env(&[
                ("POSTGRES_USER", s.postgres_user.as_str()),
                ("POSTGRES_PASSWORD", s.postgres_password.as_str()),
            ]),
            ..Default::default()
        },
    );

    services.insert(
        s.scheduler_container_name.clone(),
        airflow_service(
            ctx,
            "scheduler",
            "(airflow db upgrade || airflow upgradedb) && airflow scheduler",
            &s.postgres_host,
        ),
    );

    let mut webserver = airflow_service(
        ctx,
        "webserver",
        "if [ ! -f /tmp/.admin-created ]; then \
         airflow users create -r Admin -u admin -e admin@example.com -f admin -l user -p admin \
         && touch /tmp/.admin-created; fi; exec airflow webserver",
        &s.scheduler_container_name,
    );
    webserver.ports = vec![PortEntry::Text(format!("{}:8080", s.webserver_port))];
    services.insert(s.webserver_container_name.clone(), webserver);

    if s.triggerer_enabled {
        services.insert(
            s.triggerer_container_name.clone(),
            airflow_service(ctx, "triggerer", "airflow triggerer", &s.scheduler_container_name),
        );
    }

    ComposeFile {
        services,
        networks: BTreeMap::from([(
            NETWORK_NAME.to_string(),
            Some(NetworkDefinition {
                driver: Some("bridge".into()),
            }),
        )]),
        volumes: BTreeMap::from([
            (POSTGRES_VOLUME.to_string(), None),
            (LOGS_VOLUME.to_string(), None),
        ]),
    }
}

fn airflow_service(
    ctx: &TemplateContext<'_>,
    component: &str,
    command: &str,
    depends_on: &str,
) -> ServiceSpec {
    let s = ctx.settings;
    let sql_conn = format!(
        "postgresql://{}:{}@{}:5432",
        s.postgres_user, s.postgres_password, s.postgres_host
    );

    ServiceSpec {
        image: Some(ctx.image.clone()),
        command: Some(CommandSpec::Exec(vec![
            "bash".into(),
            "-c".into(),
            command.into(),
        ])),
        restart: Some("unless-stopped".into()),
        networks: NameList::List(vec![NETWORK_NAME.into()]),
        depends_on: NameList::List(vec![depends_on.into()]),
        labels: component_label(component),
        environment: env(&[
            ("AIRFLOW__CORE__EXECUTOR", "LocalExecutor"),
            ("AIRFLOW__CORE__SQL_ALCHEMY_CONN", sql_conn.as_str()),
            ("AIRFLOW__CORE__LOAD_EXAMPLES", "False"),
            ("AIRFLOW__CORE__FERNET_KEY", DEFAULT_FERNET_KEY),
        ]),
        env_file: ctx
            .env_file
            .clone()
            .map(|f| StringOrList::Many(vec![f]))
            .unwrap_or_default(),
        volumes: vec![
            format!("./dags:{}/dags:ro", AIRFLOW_HOME),
            format!("./plugins:{}/plugins:ro", AIRFLOW_HOME),
            format!("./include:{}/include:ro", AIRFLOW_HOME),
            format!("{}:{}/logs", LOGS_VOLUME, AIRFLOW_HOME),
        ],
        ..Default::default()
    }
}

fn env(pairs: &[(&str, &str)]) -> Environment {
    Environment::Map(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_yaml::Value::String(v.to_string())))
            .collect(),
    )
}

fn component_label(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(COMPONENT_LABEL.to_string(), component.to_string())])
}
