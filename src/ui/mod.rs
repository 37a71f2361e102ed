pub mod icons;
pub mod status;

pub use status::{endpoint_lines, render_status_table};
