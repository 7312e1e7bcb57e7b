pub mod api;
pub mod client;
pub mod server;

pub use client::{ClientError, ServiceClient};
pub use server::{router, run_server};
