//! Operations received through the node web socket.

use serde::{de, Deserialize, Deserializer};

use crate::model::{
    DiscordAudioWsClosed, GuildId, Milli, NodeStats, PlayerState, TrackData, TrackEndReason,
    TrackException,
};

#[derive(Deserialize, Debug)]
pub(crate) struct ReadyOp {
    pub(crate) resumed: bool,
    #[serde(rename = "sessionId")]
    pub(crate) session_id: String,
}

#[derive(Deserialize, Debug)]
pub(crate) struct UpdateOp {
    #[serde(rename = "guildId", deserialize_with = "deserialize_guild_id")]
    pub(crate) guild_id: GuildId,
    pub(crate) state: PlayerState,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
pub(crate) enum EventType {
    #[serde(rename = "TrackStartEvent")]
    TrackStart { track: TrackData },
    #[serde(rename = "TrackEndEvent")]
    TrackEnd {
        track: TrackData,
        reason: TrackEndReason,
    },
    #[serde(rename = "TrackExceptionEvent")]
    TrackException {
        track: TrackData,
        exception: TrackException,
    },
    #[serde(rename = "TrackStuckEvent")]
    TrackStuck {
        track: TrackData,
        #[serde(rename = "thresholdMs")]
        threshold: Milli,
    },
    #[serde(rename = "WebSocketClosedEvent")]
    WebSocketClosed(DiscordAudioWsClosed),
}

#[derive(Deserialize, Debug)]
pub(crate) struct EventOp {
    #[serde(rename = "guildId", deserialize_with = "deserialize_guild_id")]
    pub(crate) guild_id: GuildId,
    #[serde(flatten)]
    pub(crate) event: EventType,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "op")]
pub(crate) enum OpType {
    #[serde(rename = "ready")]
    Ready(ReadyOp),
    #[serde(rename = "playerUpdate")]
    PlayerUpdate(UpdateOp),
    #[serde(rename = "stats")]
    Stats(NodeStats),
    #[serde(rename = "event")]
    Event(EventOp),
}

/// The node sends snowflakes as strings.
fn deserialize_guild_id<'de, D>(deserializer: D) -> Result<GuildId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(GuildId),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Text(raw) => raw.parse().map_err(de::Error::custom),
        RawId::Number(id) => Ok(id),
    }
}
