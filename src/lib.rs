//! Core runtime for a native MongoDB wire-protocol client driver.
//!
//! This crate implements the parts of a driver that sit behind the user-facing
//! collection/database/cursor API: the wire codec, the connection pool, the
//! server monitor and topology description (SDAM), the server selection
//! algorithm, logical sessions and the transaction state machine, and the
//! operation executor that ties them together.
//!
//! BSON encoding of user types, the CRUD surface, authentication handshake
//! details, TLS/OCSP configuration and DNS SRV bootstrap are collaborators of
//! this crate, not part of it.

pub mod bson_util;
pub mod cmap;
pub mod concern;
pub mod error;
pub mod event;
pub mod operation;
pub mod options;
pub mod read_preference;
pub mod sdam;
pub mod selection_criteria;
pub mod session;

mod client;
mod runtime;

pub use client::{executor::Executor, Client};
pub use error::{Error, ErrorKind, Result};
pub use options::{ClientOptions, ServerAddress};

pub(crate) use runtime::{AsyncRuntime, RUNTIME};

/// The minimum wire version this driver can speak to.
pub const MIN_SUPPORTED_WIRE_VERSION: i32 = 6;
/// The maximum wire version this driver knows how to negotiate.
pub const MAX_SUPPORTED_WIRE_VERSION: i32 = 17;
