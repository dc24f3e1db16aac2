pub mod bus;
pub mod config;
pub mod controller;
pub mod policy;
pub mod router;
pub mod tracing_subscriber;
