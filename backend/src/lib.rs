pub mod config;
pub mod error;
pub mod history;
pub mod imaging;
pub mod model;
pub mod routes;
