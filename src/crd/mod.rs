mod backup_storage;
mod database_cluster;
mod database_engine;
mod install_plan;
mod monitoring_config;

pub use backup_storage::*;
pub use database_cluster::*;
pub use database_engine::*;
pub use install_plan::*;
pub use monitoring_config::*;
