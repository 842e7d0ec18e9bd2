// Library exports for the API server, the admin CLI and tests
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use state::AppState;
