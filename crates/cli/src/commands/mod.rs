pub mod config_cmd;
pub mod plan;
pub mod trim;
