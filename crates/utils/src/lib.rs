pub mod logging;
pub mod state_path;
