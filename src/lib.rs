// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

pub mod body;
pub mod config;
pub mod connection;
pub mod exception;
pub mod handler;
pub mod multipart;
pub mod param;
pub mod persister;
pub mod request;
pub mod resolver;
pub mod response;
pub mod session;
pub mod streamer;
pub mod util;

pub use config::Config;
pub use exception::Exception;
pub use param::{HttpRequestMethod, HttpVersion};
pub use request::Request;
pub use response::Response;
