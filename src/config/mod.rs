mod directives;
pub mod schema;

pub use schema::{Charset, Config, ConfigError};
