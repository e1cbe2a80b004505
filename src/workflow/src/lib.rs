//! Workflow model crate
//!
//! Types exchanged between the agent loop, its transports and its container runtimes:
//! the [`Action`] to run, the [`Event`] reported back, and the batch wire codec used by the
//! file and pub/sub transports.

pub mod action;
pub mod codec;
pub mod conv;
pub mod event;

pub use action::{Action, Env, Namespaces, Volume};
pub use codec::{decode_batch, encode_batch, read_batch_file, CodecError};
pub use conv::{container_name, flatten_env};
pub use event::{Event, State};
