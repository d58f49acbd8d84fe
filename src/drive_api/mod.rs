//! Google Drive v3 REST client.

mod client;
mod files;
mod types;

pub use client::DriveClient;
