#![forbid(unsafe_code)]
//! Asynchronous 9P2000 protocol library for Rust.
//!
//! This crate provides a tokio-based implementation of the 9P2000 file
//! service protocol: the wire codec for every message variant, a server
//! engine that tracks per-connection fids and in-flight tags, and a client
//! side that multiplexes many concurrent requests over one connection.
//!
//! # Overview
//!
//! The 9P protocol was developed for the Plan 9 distributed operating
//! system. A 9P server exports a file tree; clients attach to it, walk to
//! files by name, and perform reads and writes on the resulting fids.
//!
//! # Serving a file tree
//!
//! 1. Define a type for your per-fid state (or use `()` for stateless fids)
//! 2. Implement the [`srv::Filesystem`] trait for your filesystem type
//! 3. Start the server with [`srv::srv`] or serve a single stream with
//!    [`srv::serve_connection`]
//!
//! ```no_run
//! use styx::{srv::{Filesystem, Fid, srv}, FCall, QId, QIdType, Result};
//! use async_trait::async_trait;
//!
//! #[derive(Clone)]
//! struct MyFs;
//!
//! #[async_trait]
//! impl Filesystem for MyFs {
//!     type Aux = ();
//!
//!     async fn rattach(
//!         &self,
//!         _fid: &Fid<Self::Aux>,
//!         _afid: Option<&Fid<Self::Aux>>,
//!         _uname: &str,
//!         _aname: &str,
//!     ) -> Result<FCall> {
//!         Ok(FCall::RAttach {
//!             qid: QId { typ: QIdType::DIR, version: 0, path: 1 },
//!         })
//!     }
//!
//!     // Implement the other operations your tree supports...
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     srv(MyFs, "tcp!127.0.0.1!564").await
//! }
//! ```
//!
//! # Mounting a server
//!
//! [`client::Client::mount`] dials an address, negotiates the protocol
//! version and attaches to the served tree. The returned client hands out
//! [`client::Cfid`] file handles whose `read`/`write`/`stat` calls may be
//! issued from any number of tasks concurrently; replies are matched to
//! callers by tag, with one caller at a time elected to read the socket on
//! behalf of all of them.
//!
//! ```no_run
//! # async fn doc() -> styx::Result<()> {
//! let client = styx::client::Client::mount("unix!/tmp/9p.sock", "glenda", "").await?;
//! let mut fid = client.open("/etc/motd", styx::om::READ).await?;
//! let text = fid.read(4096).await?;
//! fid.clunk().await?;
//! client.unmount().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Transport
//!
//! Addresses take the form `scheme!address[!port]`:
//! - **TCP**: `"tcp!host!port"` (e.g., `"tcp!0.0.0.0!564"`)
//! - **Unix domain sockets**: `"unix!path"` (e.g., `"unix!/tmp/socket"`)
//!
//! [`transport::register_scheme`] adds user-defined schemes.
//!
//! # Error Handling
//!
//! 9P2000 errors are strings. Handlers report errors by returning
//! [`error::Error`]; the engine renders them into `Rerror` replies. The
//! well-known protocol strings live in [`error::string`].
pub mod client;
pub mod error;
pub mod fcall;
pub mod serialize;
pub mod srv;
pub mod sync;
pub mod transport;
#[macro_use]
pub mod utils;

pub use crate::error::string as errstr;
pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::utils::Result;
