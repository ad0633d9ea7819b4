// Library exports for delivery-ops
// Integration tests and benches reach the modules through here

pub mod coordinator;
pub mod core;
pub mod db;
pub mod logging;
pub mod services;
pub mod utils;
