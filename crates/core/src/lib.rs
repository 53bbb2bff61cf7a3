pub mod cluster;
pub mod config;
pub mod error;
pub mod identifier;
pub mod job;
pub mod run;

pub use cluster::*;
pub use config::Config;
pub use error::*;
pub use identifier::*;
pub use job::*;
pub use run::*;
