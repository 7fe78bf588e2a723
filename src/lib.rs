//! Music playback core for chat bots, driving Lavalink v4 nodes.
//!
//! A [`context::Voicelink`] owns a [`pool::NodePool`] of audio nodes and the
//! collaborators provided by the bot ([`host::Host`]). Each guild gets a
//! [`player::Player`] bound to one node, with its own [`queue::Queue`],
//! filters and vote bookkeeping. Node events (track end, stuck, exception)
//! drive the players on their own; commands go through the player methods.

#![deny(missing_docs)]
#![warn(missing_docs)]
#![doc(test(attr(deny(warnings))))]

mod op;
mod penalty;
mod socket;
mod utils;

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod filters;
pub mod host;
pub mod model;
pub mod node;
pub mod placeholders;
pub mod player;
pub mod pool;
pub mod queue;
pub mod track;
pub mod vote;

pub use penalty::LoadWeights;
pub use utils::ExponentialBackoff;
