pub mod config;
pub mod error;
pub mod field_path;
pub mod resolver;
pub mod resource_path;
pub mod template;

pub use config::*;
pub use error::*;
pub use field_path::*;
pub use resolver::*;
pub use resource_path::*;
pub use template::*;
