#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation,
    clippy::too_many_lines,
)]

mod client;
mod connection;
pub mod enums;
pub mod flags;
pub mod frame;
pub mod handler;
pub mod hpack;
pub mod huffman;
mod pool;
pub mod request;
pub mod response;
pub mod server;
pub mod settings;
mod stream;
mod stream_coordinator;
pub mod types;

pub use bytes::Bytes;
pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use handler::{DispatchPolicy, Handler};
pub use request::{Method, Request};
pub use response::{Body, Response};
pub use server::{serve, ServerConfig};
pub use types::{ClientError, H2Error};
pub use url::Url;
