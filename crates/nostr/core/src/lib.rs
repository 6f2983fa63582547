//! Nostr protocol primitives shared by the relay pool: events and filters.

pub mod filter;
pub mod nip01;

pub use filter::{Filter, FilterError};
pub use nip01::{
    Event, KIND_CONTACTS, KIND_METADATA, KIND_RECOMMEND_RELAY, KIND_SHORT_TEXT_NOTE,
};
