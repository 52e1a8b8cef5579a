pub mod agent;
pub mod boot;
pub mod config;
pub mod cyclic_buffer;
pub mod error;
pub mod forward;
pub mod net;
pub mod registry;
pub mod supervisor;
pub mod wire;
