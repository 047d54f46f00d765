mod client;
mod constants;
mod credentials;
pub mod types;

pub use client::HttpBackend;
pub use constants::{DEFAULT_PART_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
pub use credentials::{EnvToken, NoCredentials, StaticToken};
