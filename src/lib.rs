pub mod accessibility;
pub mod browser;
pub mod config;
pub mod discover;
pub mod flow;
pub mod identity;
pub mod report;
pub mod runner;
pub mod server;
pub mod smoke;
pub mod visual;
