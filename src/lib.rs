mod image_store;
mod inference_service;
mod model_host;
mod model_service;
mod ort_service;
mod routes;
mod server;
mod telemetry;

#[cfg(test)]
mod test_utils;

pub mod app;
pub mod config;

pub use app::start_app;
