pub mod loader;
pub mod models;
pub mod panel;
pub mod pipeline;
pub mod report;

pub use models::{Config, PeriodPolicy};
pub use panel::PanelBuilder;
