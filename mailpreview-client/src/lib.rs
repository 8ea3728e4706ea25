pub mod actions;
pub mod app;
pub mod config_panel;
pub mod console;
pub mod gateway;
pub mod preview;
pub mod storage;

pub use app::{App, AppConfig};
pub use gateway::{Endpoints, Gateway, GatewayError};
