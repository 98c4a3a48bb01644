pub mod config;
pub mod digest;
pub mod error;
pub mod value;

pub use config::Config;
pub use digest::*;
pub use error::*;
pub use value::*;
