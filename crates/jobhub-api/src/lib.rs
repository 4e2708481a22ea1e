//! Client for the REST endpoints the sync layer reads from and writes to.
//!
//! Every request carries the stored access token as a bearer token. List
//! endpoints tolerate malformed bodies by returning an empty list.

mod capabilities;
mod client;
mod error;
mod messages;
mod notifications;
mod users;

pub use client::ApiClient;
pub use error::ApiError;
