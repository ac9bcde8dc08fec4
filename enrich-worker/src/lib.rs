pub mod config;
pub mod error;
pub mod gate;
pub mod host;
pub mod mapping;
pub mod merger;
pub mod packet;
pub mod record;
pub mod report;
pub mod resolver;
pub mod service;
pub mod services;
pub mod stage;
pub mod test_utils;
