#![forbid(unsafe_code)]

//! Shared models and pure admission logic for the hunting-task client.

pub mod cycle;
pub mod history;
pub mod identity;
pub mod ids;
pub mod model;
pub mod policy;
pub mod time;
pub mod wire;

pub use cycle::*;
pub use history::*;
pub use identity::*;
pub use ids::*;
pub use model::*;
pub use policy::*;
pub use time::*;
pub use wire::{decode_records, encode_records, DecodeError, EncodeError};
