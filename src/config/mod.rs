pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{load_config, load_settings};
pub use models::*;
pub use validation::{ServerConfigValidator, ValidationError, ValidationResult};
