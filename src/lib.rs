//! Typed client binding for the Testimonium block header relay.
//!
//! [`testimonium::Testimonium`] wraps a generic contract core
//! ([`ethereum::BoundContract`]) that encodes calls, submits transactions and
//! merges historical and live event logs behind a single cursor.

pub mod config;
pub mod error;
pub mod ethereum;
pub mod testimonium;

pub use error::{BackendError, BindError, BindResult};
