pub mod bridge;
pub mod codec;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod link;
pub mod mav_server;
pub mod mission;
pub mod vehicle;
