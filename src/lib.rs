pub mod config;
pub mod importer;
pub mod instance;
pub mod supervisor;
pub mod utils;
pub mod validator;

pub use config::GlobalConfig;
pub use instance::{ServerInstance, StartupMode};
pub use supervisor::{Supervisor, SupervisorError};
