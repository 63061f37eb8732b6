//! Configuration types and loading for the flow services.
//!
//! Configuration is layered: a `base` file, an environment-specific file
//! (`dev`/`staging`/`prod`), and `APP_`-prefixed environment variable
//! overrides, merged in that order.

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{LoadConfigError, load_config};
