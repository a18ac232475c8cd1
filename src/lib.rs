pub mod appointment;
pub mod bus;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod ids;
pub mod matrix;
pub mod normalize;
pub mod notification;
pub mod policy;
pub mod scheduler;
pub mod service;
