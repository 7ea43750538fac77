pub mod assessment;
pub mod btc;
pub mod cleanup;
pub mod config;
pub mod destination;
pub mod fallback;
pub mod model;
pub mod orchestrator;
pub mod report;
pub mod resolver;
pub mod runner;
pub mod store;
