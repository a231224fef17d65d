pub mod analysis;
pub mod drilldown;
pub mod handlers;
pub mod sql;
mod value;

pub use handlers::{ApiState, router};
