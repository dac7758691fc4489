//! An asynchronous, bidirectional, reliable, in-order messaging transport layered on top of
//! plain HTTP request/response: long-polling full-duplex emulation over HTTP/1.
//!
//! Every outbound POST's body carries whatever outbound messages are queued; its still-unread
//! response body becomes the next inbound receive channel, "donated" from the sender worker to
//! the receiver worker through a shared monitor. See [`Context`] and [`Connection`] for the
//! entry points; [`Message`]/[`Decoder`]/[`DecoderRegistry`] for the application-facing message
//! boundary.
//!
//! ```no_run
//! use std::sync::Arc;
//! use messaging_http::{Address, ConnectionId, Context, Error};
//!
//! # async fn run() -> Result<(), Error> {
//! let ctx = Context::new();
//! let address = Address::new("http://localhost:8080/messaging".parse().unwrap());
//! let connection = ctx.register(ConnectionId::new("example"), address);
//! connection.start(
//!     |messages| println!("received {} messages", messages.len()),
//!     || println!("started"),
//!     |err| eprintln!("connection error: {err}"),
//! )?;
//! connection.send(vec![]).await;
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

mod connection;
mod context;
mod error;
mod message;
mod receiver;
mod rt;
mod sender;
mod wire;

pub use connection::{Address, Connection, ConnectionConfig, ConnectionId, PROTOCOL_NAME};
pub use context::{Builder as ContextBuilder, Context};
pub use error::{Error, Result};
pub use message::{Decoder, DecoderRegistry, Message, TempFileContext};
pub use rt::{Executor, TokioExecutor};
