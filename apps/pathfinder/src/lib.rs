pub mod agent;
pub mod config;
pub mod control;
pub mod logging;
pub mod protocol;
pub mod script;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod widgets;
