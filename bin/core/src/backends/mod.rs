//! Clients for the execution substrate and its satellites. Only
//! the request / response shapes the core consumes are modeled.

pub mod chronos;
pub mod exhibitor;
pub mod http;
pub mod marathon;
pub mod mesos;
pub mod registry;
pub mod volume;
