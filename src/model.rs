//! Wire payloads of the node REST API and event socket.
//!
//! Everything here mirrors the JSON documents of a Lavalink v4 node: load
//! results, player updates, filter sections, stats and session settings.

use std::{collections::HashMap, fmt::Display};

use serde::{de, Deserialize, Deserializer, Serialize};

// ############### Aliases ###############

/// Guild snowflake.
pub type GuildId = u64;
/// User snowflake.
pub type UserId = u64;
/// Channel snowflake.
pub type ChannelId = u64;
/// Duration or timestamp in milliseconds.
pub type Milli = u64;
/// Duration in seconds.
pub type Secs = u64;
#[allow(missing_docs)]
pub type StatusCode = u16;
/// Player volume, 100 being the source volume.
pub type Volume = u16;
/// Volume multiplier of the filters section, 1.0 being unchanged.
pub type FilterVolume = f64;
/// Plugin provided json, kept untouched.
pub type PluginData = serde_json::Value;
#[allow(missing_docs)]
pub type PluginName = String;
/// Code sent by the voice server when it closes a connection.
pub type CloseEventCode = u16;

// ############### REST ###############

/// Error document returned by the node REST API.
#[derive(Deserialize, Debug, Clone)]
pub struct ApiError {
    /// When it happened, in unix milliseconds.
    pub timestamp: Milli,
    #[allow(missing_docs)]
    pub status: StatusCode,
    /// Reason phrase of `status`.
    pub error: String,
    #[allow(missing_docs)]
    pub message: String,
}

impl Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "got: {}; reason: {}", self.status, self.message)
    }
}

/// Metadata of a track.
#[allow(missing_docs)]
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    /// Id of the track within its source.
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    pub length: Milli,
    pub is_stream: bool,
    /// Where playback starts.
    pub position: Milli,
    pub title: String,
    pub uri: Option<String>,
    /// Thumbnail link.
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    /// Source manager that resolved the track, like `youtube`.
    pub source_name: String,
}

/// A playable track as the node hands it out.
#[derive(Deserialize, Debug, Clone)]
pub struct TrackData {
    /// Base64 token the node plays from.
    pub encoded: String,
    #[allow(missing_docs)]
    pub info: TrackInfo,
    #[allow(missing_docs)]
    #[serde(rename = "pluginInfo", default)]
    pub plugin_info: Option<PluginData>,
    /// Whatever was attached on the last player update.
    #[serde(rename = "userData", default)]
    pub user_data: Option<PluginData>,
}

#[allow(missing_docs)]
#[derive(Deserialize, Debug, Clone)]
pub struct PlaylistInfo {
    pub name: String,
    /// Index of the track the link pointed at.
    #[serde(rename = "selectedTrack")]
    #[serde(deserialize_with = "deserialize_optional_index")]
    pub selected_track: Option<u64>,
}

#[allow(missing_docs)]
#[derive(Deserialize, Debug, Clone)]
pub struct PlaylistData {
    pub info: PlaylistInfo,
    #[serde(rename = "pluginInfo", default)]
    pub plugin_info: Option<PluginData>,
    pub tracks: Vec<TrackData>,
}

/// Outcome of the load tracks endpoint.
#[derive(Deserialize, Debug)]
#[serde(tag = "loadType", content = "data")]
pub enum LoadResult {
    /// A direct link to one track.
    #[serde(rename = "track")]
    SingleTrack(TrackData),
    /// A playlist or album link.
    #[serde(rename = "playlist")]
    Playlist(PlaylistData),
    /// A prefixed search query (`ytsearch:`, `scsearch:`...).
    #[serde(rename = "search")]
    TracksSearch(Vec<TrackData>),
    /// Nothing matched.
    #[serde(rename = "empty")]
    EmptyMatch(
        #[serde(deserialize_with = "deserialize_empty_match")]
        ()
    ),
    /// The source failed to load it.
    #[serde(rename = "error")]
    Fail(TrackException),
}

pub use self::LoadResult::*;

/// Periodic player state pushed on the event socket.
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct PlayerState {
    /// Node clock, in unix milliseconds.
    pub time: Milli,
    #[allow(missing_docs)]
    pub position: Milli,
    /// Whether the node holds a voice connection for the guild.
    pub connected: bool,
    /// Round trip to the voice server, absent while disconnected.
    #[serde(deserialize_with = "deserialize_optional_index")]
    pub ping: Option<Milli>,
}

/// Voice session credentials handed over by the voice gateway.
#[allow(missing_docs)]
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct VoiceState {
    pub token: String,
    pub endpoint: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

// ############### Filters ###############

/// Gain of one of the 15 equalizer bands.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
pub struct Equalizer {
    /// In `0..=14`.
    pub band: u8,
    /// In `-0.25..=1.0`, 0 leaving the band as is.
    pub gain: f64,
}

/// Vocal removal.
#[allow(missing_docs)]
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Karaoke {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mono_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_band: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_width: Option<f64>,
}

/// Speed, pitch and rate multipliers. None of them may be negative.
#[allow(missing_docs)]
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct Timescale {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
}

/// Volume oscillation.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct Tremolo {
    /// Positive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    /// In `(0.0, 1.0]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<f64>,
}

/// Pitch oscillation.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct Vibrato {
    /// In `(0.0, 14.0]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    /// In `(0.0, 1.0]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<f64>,
}

/// Stereo panning.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct Rotation {
    /// Full turns per second.
    #[serde(rename = "rotationHz")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
}

#[allow(missing_docs)]
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Distortion {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sin_offset: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sin_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cos_offset: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cos_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tan_offset: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tan_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
}

/// Cross feed between the left and right channels, every factor in
/// `0.0..=1.0`.
#[allow(missing_docs)]
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMix {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_to_left: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_to_right: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right_to_left: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right_to_right: Option<f64>,
}

/// Cuts high frequencies.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct LowPass {
    /// Values up to 1.0 disable it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoothing: Option<f64>,
}

/// Filters section of a player update. It replaces every filter on the node.
#[allow(missing_docs)]
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerFilters {
    /// In `0.0..=5.0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<FilterVolume>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equalizer: Option<Vec<Equalizer>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub karaoke: Option<Karaoke>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timescale: Option<Timescale>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tremolo: Option<Tremolo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vibrato: Option<Vibrato>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Rotation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distortion: Option<Distortion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_mix: Option<ChannelMix>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_pass: Option<LowPass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_filters: Option<HashMap<PluginName, serde_json::Value>>,
}

// ############### Player updates ###############

/// Track section of a player update. `encoded: None` stops the player.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct UpdateTrack {
    #[allow(missing_docs)]
    pub encoded: Option<String>,
}

/// Body of the update player endpoint.
///
/// Only the present fields are changed on the node.
#[allow(missing_docs)]
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<UpdateTrack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Milli>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Volume>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<PlayerFilters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceState>,
}

impl PlayerUpdate {
    /// Starts playing `encoded` from the beginning.
    pub fn play(encoded: &str) -> Self {
        Self {
            track: Some(UpdateTrack { encoded: Some(encoded.to_string()) }),
            position: Some(0),
            paused: Some(false),
            ..Default::default()
        }
    }

    /// Stops the current track.
    pub fn stop() -> Self {
        Self {
            track: Some(UpdateTrack { encoded: None }),
            ..Default::default()
        }
    }
}

// ############### Stats ###############

/// Bytes.
#[allow(missing_docs)]
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct Memory {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[allow(missing_docs)]
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct Cpu {
    pub cores: u64,
    /// Load of the whole host, in `0.0..=1.0`.
    #[serde(rename = "systemLoad")]
    pub system_load: f64,
    /// Load of the node process alone.
    #[serde(rename = "lavalinkLoad")]
    pub process_load: f64,
}

/// Audio frames of the last minute.
#[allow(missing_docs)]
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct FrameStats {
    pub sent: u64,
    pub nulled: u64,
    /// Expected frames minus the sent ones.
    pub deficit: i64,
}

/// Resource usage reported by a node.
#[allow(missing_docs)]
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeStats {
    #[serde(rename = "players")]
    pub players_total: u64,
    /// Players currently streaming a track.
    #[serde(rename = "playingPlayers")]
    pub players_active: u64,
    pub uptime: Milli,
    pub memory: Memory,
    pub cpu: Cpu,
    /// Only sent on the socket, and only while some player is connected.
    #[serde(rename = "frameStats", default)]
    pub frame_stats: Option<FrameStats>,
}

// ############### Events ###############

/// Why the track ended.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Whether the player may start the next track.
    pub fn may_start_next(&self) -> bool {
        matches!(self, Self::Finished | Self::LoadFailed)
    }
}

#[allow(missing_docs)]
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TrackExceptionSeverity {
    /// Expected, like a region locked video.
    Common,
    /// Likely caused by the source.
    Suspicious,
    /// Likely a node bug.
    Fault,
}

/// Failure while loading or playing a track.
#[derive(Deserialize, Debug, Clone)]
#[allow(missing_docs)]
pub struct TrackException {
    pub message: Option<String>,
    pub severity: TrackExceptionSeverity,
    pub cause: String,
}

impl Display for TrackException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.message {
            Some(ref message) => write!(f, "{message}"),
            None => write!(f, "{}", self.cause),
        }
    }
}

/// The node lost its voice connection for a guild.
#[derive(Deserialize, Debug, Clone)]
#[allow(missing_docs)]
pub struct DiscordAudioWsClosed {
    pub code: CloseEventCode,
    pub reason: String,
    /// Closed by the voice server rather than by the node.
    #[serde(rename = "byRemote")]
    pub remote: bool,
}

// ############### Sessions ###############

/// Body of the update session endpoint.
#[derive(Serialize, Debug)]
pub struct SessionState {
    #[allow(missing_docs)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resuming: Option<bool>,
    /// Seconds the node keeps the players after the socket drops.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Secs>,
}

impl SessionState {
    /// Enables resuming with the given timeout.
    pub fn resume_within(timeout: Secs) -> Self {
        Self {
            resuming: Some(true),
            timeout: Some(timeout),
        }
    }
}

/// Session settings the node applied.
#[allow(missing_docs)]
#[derive(Deserialize, Debug)]
pub struct CurrentSessionState {
    pub resuming: bool,
    pub timeout: Secs,
}

// ############### Deserialization Utils ###############

/// Negative values mean absent (`selectedTrack: -1`, `ping: -1`).
fn deserialize_optional_index<'de, D>(
    deserializer: D
) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = i64::deserialize(deserializer)?;
    Ok(u64::try_from(value).ok())
}

/// Accepts any map and drops its content.
fn deserialize_empty_match<'de, D>(
    deserializer: D
) -> Result<(), D::Error>
where
    D: Deserializer<'de>,
{
    struct AnyMap;

    impl<'de> de::Visitor<'de> for AnyMap {
        type Value = ();

        fn expecting(
            &self,
            formatter: &mut std::fmt::Formatter
        ) -> std::fmt::Result {
            formatter.write_str("a map")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: de::MapAccess<'de>,
        {
            while map.next_entry::<de::IgnoredAny, de::IgnoredAny>()?.is_some() {}
            Ok(())
        }
    }

    deserializer.deserialize_map(AnyMap)
}
