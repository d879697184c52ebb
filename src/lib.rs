pub mod cloud;
pub mod config;
pub mod error;
pub mod events;
pub mod http_client;
pub mod platform;
pub mod privet;
pub mod settings;
pub mod url_builder;
pub mod wifi;
