pub mod client;
pub mod error;
pub mod models;
pub mod resolver;

pub use client::BackendClient;
pub use error::ApiError;
pub use resolver::ConnectivityResolver;
