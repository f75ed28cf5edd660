pub mod commands;
pub mod config;
pub mod container;
pub mod events;
pub mod proxy;
