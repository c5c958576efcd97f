//! Client for the parts of the UpCloud API used to manage block storage:
//! storages, their backups, and the servers they are attached to.

pub mod client;
pub mod error;
pub mod http;
pub mod types;

pub use client::Api;
pub use error::{codes, Error};
pub use http::{Client, DEFAULT_API_URL};
pub use types::*;
