//! All error types that the API has.

use tokio_tungstenite::tungstenite;

use crate::model::ApiError;

/// Collection of errors returned by nodes, players and queues.
///
/// User input and policy errors leave every piece of state untouched, so
/// they can be reported back to whoever issued the command.
#[derive(thiserror::Error, Debug)]
pub enum VoicelinkError {
    // ############### User input ###############
    /// Position outside the current queue or history bounds.
    #[error("invalid position: {0}")]
    TrackInvalidPosition(usize),
    /// Repeat mode isn't one of `off`, `track` or `queue`.
    #[error("invalid repeat mode `{0}`")]
    InvalidRepeatMode(String),
    /// Couldn't parse a time expression like `1:20`.
    #[error("malformed time `{0}`")]
    MalformedTime(String),
    /// Volume must be between 0 and 150.
    #[error("volume {0} out of range (0..=150)")]
    VolumeOutOfRange(u16),
    /// An invalid argument was passed to a filter.
    #[error("invalid filter argument: {0}")]
    FilterInvalidArgument(String),
    /// A filter with the same tag is already applied.
    #[error("filter tag `{0}` already in use")]
    FilterTagAlreadyInUse(String),
    /// There isn't any applied filter with the given tag.
    #[error("filter tag `{0}` not found")]
    FilterTagInvalid(String),

    // ############### Capacity and policy ###############
    /// Queue reached its configured cap.
    #[error("queue is full (max {0} tracks)")]
    QueueFull(usize),
    /// Duplicate suppression is enabled and the track is already queued.
    #[error("track `{0}` is already in the queue")]
    DuplicateTrack(String),
    /// The actor isn't privileged enough to run the action.
    #[error("missing permission")]
    MissingPermission,

    // ############### Transport ###############
    /// There was a problem while creating the node.
    #[error("couldn't create node: {0}")]
    NodeCreationError(String),
    /// There was a problem while connecting to the node.
    #[error("couldn't connect to node: {0}")]
    NodeConnectionFailure(String),
    /// The node's connection is closed.
    #[error("node connection closed")]
    NodeConnectionClosed,
    /// The node is currently unavailable.
    #[error("node `{0}` is not available")]
    NodeNotAvailable(String),
    /// There are no nodes currently available.
    #[error("there are no nodes available")]
    NoNodesAvailable,
    /// Node hasn't received its session id yet.
    #[error("node isn't connected")]
    NotConnected,
    /// The node reported an error while loading tracks.
    #[error("couldn't load track: {0}")]
    TrackLoadError(String),
    /// Track token is malformed or truncated.
    #[error("couldn't decode track: {0}")]
    TrackDecodeError(String),
    /// No Spotify credentials were configured.
    #[error("spotify client authorization is missing")]
    InvalidSpotifyClientAuthorization,
    /// The client received an error response from the node.
    #[error("{0}")]
    InstanceError(ApiError),
    /// The request couldn't be sent.
    #[error(transparent)]
    RequestError(reqwest::Error),
    /// The response content is corrupted.
    #[error("corrupted response: {0}")]
    ParseResponseError(reqwest::Error),
    /// The web socket connection returned an error.
    #[error(transparent)]
    WebSocketError(#[from] tungstenite::Error),
    /// Received an unexpected web socket message.
    #[error("corrupted socket message: {0}")]
    ParseSocketMessageError(#[from] serde_json::Error),
    /// First web socket message wasn't the ready operation.
    #[error("missing ready operation")]
    MissingReadyMessage,

    // ############### Invariants ###############
    /// Guild already has a player.
    #[error("already connected to a voice channel")]
    AlreadyConnected,
    /// Operation issued against a destroyed player.
    #[error("player was torn down")]
    PlayerTornDown,
    /// Guild doesn't have a player.
    #[error("there's no player for this guild")]
    PlayerNotFound,

    // ############### Collaborators ###############
    /// The settings store failed.
    #[error("store error: {0}")]
    StoreError(String),
    /// The voice gateway failed.
    #[error("voice gateway error: {0}")]
    VoiceGatewayError(String),
    /// Configuration file is missing or invalid.
    #[error("invalid config: {0}")]
    ConfigError(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, VoicelinkError>;
