//! Postgres Frontend and Backend Protocol, versions 1.0 and 2.0
//!
//! ## Messaging Overview
//!
//! All communication after startup is through a stream of messages. The first byte of a
//! message identifies the message type, the rest is a sequence of typed fields determined
//! by the message type. Unlike protocol 3.0 there is no length word, a message is
//! complete only after each of its fields is read.
//!
//! ```text
//! ┏━━━━┳━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━┓
//! ┃ Ty ┃ Fields                         ┃
//! ┣━━━━╋━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━┫
//! ┃ u8 ┃ i16 / i32 / nul string / [u8]  ┃
//! ┣━━━━╋━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━┫
//! ┃ 43 ┃ "UPDATE 3\0"                   ┃
//! ┗━━━━┻━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━┛
//! ```
//!
//! The very first message sent by the client is a fixed size startup packet, prefixed
//! with its length and without message type byte. Servers 6.2 and older expect integer
//! fields after it in reversed byte order.
//!
//! See [`Generation`] for the differences between protocol generations.

pub mod version;
pub mod frontend;
pub mod backend;
pub mod auth;

mod error;

pub use version::{ByteOrder, Generation, ServerVersion, StartupLayout};
pub use frontend::FrontendProtocol;
pub use backend::{Authentication, BackendKeyData};
pub use auth::PasswordChallenge;
pub use error::{ProtocolError, ServerError};
