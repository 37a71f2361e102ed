//! Status table and connection details.

use console::style;

use crate::engine::ContainerStatus;
use crate::stack::Endpoints;

const HEADERS: [&str; 3] = ["Name", "State", "Ports"];
const COLUMN_GAP: usize = 2;

/// Render `Name / State / Ports` with left-aligned, padded columns.
///
/// Ports are the published host ports, deduplicated in first-seen order.
pub fn render_status_table(statuses: &[ContainerStatus]) -> String {
    let rows: Vec<[String; 3]> = statuses
        .iter()
        .map(|s| [s.name.clone(), s.state.clone(), published_ports(s)])
        .collect();

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let header = HEADERS.map(str::to_string);
    for row in std::iter::once(&header).chain(rows.iter()) {
        let line = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width + COLUMN_GAP))
            .collect::<String>();
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

fn published_ports(status: &ContainerStatus) -> String {
    let mut seen = Vec::new();
    for port in status.ports.iter().filter_map(|p| p.public_port) {
        if !seen.contains(&port) {
            seen.push(port);
        }
    }
    seen.iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Lines printed after a successful start.
pub fn endpoint_lines(endpoints: &Endpoints) -> Vec<String> {
    vec![
        format!(
            "Airflow Webserver: {}",
            style(format!("http://localhost:{}", endpoints.webserver_port)).cyan()
        ),
        format!(
            "Postgres Database: {}",
            style(format!("localhost:{}/postgres", endpoints.postgres_port)).cyan()
        ),
        format!(
            "The default credentials are {}:{}",
            endpoints.username, endpoints.password
        ),
    ]
}
