//! Events flowing from nodes to players, and from players to the command
//! layer.
//!
//! A node routes every event to the player bound to the guild it belongs to,
//! through a channel owned by that player. Events of one node reach a player
//! in the same order the node sent them.
//!
//! Players publish [`PlayerNotice`]s on a broadcast channel. Notices are only
//! informative: nothing inside the crate depends on someone receiving them.
//!
//! # Example
//!
//! ```no_run
//! # use voicelink::player::Player;
//! # use voicelink::event::PlayerNotice;
//! # #[allow(dead_code)]
//! # async fn example(player: Player) {
//! let mut notices = player.subscribe();
//!
//! while let Ok(notice) = notices.recv().await {
//!     match notice {
//!         PlayerNotice::TrackStarted { track, .. } => println!("playing {}", track.title()),
//!         PlayerNotice::Destroyed { .. } => break,
//!         _ => (),
//!     }
//! }
//! # }
//! ```

use crate::model::{
    DiscordAudioWsClosed, GuildId, Milli, PlayerState, TrackEndReason, TrackException,
};
use crate::op::EventType;
use crate::track::Track;

/// Event routed by a node to one player.
#[derive(Debug, Clone)]
pub(crate) enum PlayerEvent {
    State(PlayerState),
    TrackStart {
        encoded: String,
    },
    TrackEnd {
        encoded: String,
        reason: TrackEndReason,
    },
    TrackException {
        encoded: String,
        exception: TrackException,
    },
    TrackStuck {
        encoded: String,
        threshold: Milli,
    },
    VoiceClosed(DiscordAudioWsClosed),
}

impl From<EventType> for PlayerEvent {
    fn from(event: EventType) -> Self {
        match event {
            EventType::TrackStart { track } => PlayerEvent::TrackStart {
                encoded: track.encoded,
            },
            EventType::TrackEnd { track, reason } => PlayerEvent::TrackEnd {
                encoded: track.encoded,
                reason,
            },
            EventType::TrackException { track, exception } => PlayerEvent::TrackException {
                encoded: track.encoded,
                exception,
            },
            EventType::TrackStuck { track, threshold } => PlayerEvent::TrackStuck {
                encoded: track.encoded,
                threshold,
            },
            EventType::WebSocketClosed(closed) => PlayerEvent::VoiceClosed(closed),
        }
    }
}

/// Something the command layer may want to show.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum PlayerNotice {
    /// A track was sent to the node.
    TrackStarted { guild: GuildId, track: Track },
    /// The node failed to play a track. The next one starts shortly.
    TrackException {
        guild: GuildId,
        track: Option<Track>,
        message: String,
    },
    /// A track stopped receiving audio frames.
    TrackStuck {
        guild: GuildId,
        track: Option<Track>,
        threshold: Milli,
    },
    /// Nothing left to play.
    QueueEnded { guild: GuildId },
    /// The player was torn down.
    Destroyed { guild: GuildId },
}
