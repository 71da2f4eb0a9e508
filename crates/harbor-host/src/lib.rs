pub mod approval;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod events;
pub mod focus;
pub mod gateway;
pub mod logging;
pub mod native;
pub mod periodic;
pub mod router;
pub mod settings;
pub mod surface;
pub mod theme;

pub use coordinator::{Coordinator, HostOptions};
pub use events::HostEvent;
