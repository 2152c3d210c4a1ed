pub mod agents;
pub mod config;
pub mod event_bus;
pub mod paths;
pub mod sessions;

pub use agents::*;
pub use config::*;
pub use event_bus::*;
pub use paths::*;
pub use sessions::*;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;
