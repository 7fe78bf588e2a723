//! Audio nodes.
//!
//! A [`Node`] holds one REST client and one web socket session with a
//! Lavalink v4 server. Players bound to a node receive its events through a
//! channel keyed by guild.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{de::IgnoredAny, Deserialize};
use tokio::sync::{mpsc, RwLock};
use url::Url;

use crate::config::SpotifyConfig;
use crate::error::{Result, VoicelinkError};
use crate::event::PlayerEvent;
use crate::model::{
    CurrentSessionState, GuildId, LoadResult, NodeStats, PlayerUpdate, Secs, SessionState,
    TrackData, UserId,
};
use crate::penalty::{FailureKind, FailurePenalty, LoadWeights};
use crate::socket::Socket;
use crate::track::{Playlist, SearchResult, SearchType, Track};
use crate::utils::{process_empty_request, process_request, spawn_fut, tcp_latency, ExponentialBackoff};

/// Node unique identifier.
pub type NodeName = String;

const LATENCY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection config used at node registration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[allow(missing_docs)]
pub struct NodeConfig {
    /// User friendly unique identifier used internally to query the node.
    #[serde(default)]
    pub identifier: NodeName,
    pub host: String,
    pub port: u16,
    pub password: String,
    #[serde(default)]
    pub secure: bool,
    /// Region tag used by region based selection.
    #[serde(default)]
    pub region: Option<String>,
    /// Enables session resuming with this timeout.
    #[serde(default)]
    pub resume_timeout: Option<Secs>,
}

impl NodeConfig {
    fn parse_url(&self, base: &str, path: &str) -> Result<Url> {
        let raw = format!(
            "{}{}://{}:{}/v4{}",
            base,
            if self.secure { "s" } else { "" },
            self.host,
            self.port,
            path
        );
        Url::parse(&raw).map_err(|e| VoicelinkError::NodeCreationError(format!("{raw}: {e}")))
    }

    fn rest(&self) -> Result<Url> {
        self.parse_url("http", "/")
    }

    fn ws(&self) -> Result<Url> {
        self.parse_url("ws", "/websocket")
    }
}

/// Settings shared by every node of a pool.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    /// The bot user id.
    pub bot_id: UserId,
    /// Search engine used for queries that aren't links.
    pub default_search: SearchType,
    /// Enables spotify searches.
    pub spotify: Option<SpotifyConfig>,
}

/// Request/response side of a node.
///
/// [`RestTransport`] talks to a real node; other implementations can stand
/// in for it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolves a link or a prefixed search query.
    async fn load_tracks(&self, identifier: &str) -> Result<LoadResult>;

    /// Decodes a track token.
    async fn decode_track(&self, encoded: &str) -> Result<TrackData>;

    /// Applies `update` on the player of `guild`.
    async fn update_player(&self, session: &str, guild: GuildId, update: &PlayerUpdate) -> Result<()>;

    /// Destroys the player of `guild`.
    async fn destroy_player(&self, session: &str, guild: GuildId) -> Result<()>;

    /// Fetches the node stats.
    async fn stats(&self) -> Result<NodeStats>;

    /// Changes the session resuming state.
    async fn update_session(&self, session: &str, state: &SessionState) -> Result<CurrentSessionState>;
}

/// [`Transport`] over the node REST API.
pub struct RestTransport {
    rest_url: Url,
    client: reqwest::Client,
}

impl RestTransport {
    /// Builds the client for the node described by `config`.
    pub fn new(config: &NodeConfig) -> Result<Self> {
        let password = HeaderValue::from_str(&config.password)
            .map_err(|e| VoicelinkError::NodeCreationError(format!("invalid password: {e}")))?;

        let mut rest_headers = HeaderMap::new();
        rest_headers.insert("Authorization", password);

        let client = reqwest::Client::builder()
            .default_headers(rest_headers)
            .build()
            .map_err(|e| VoicelinkError::NodeCreationError(e.to_string()))?;

        Ok(Self { rest_url: config.rest()?, client })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.rest_url
            .join(path)
            .map_err(|e| VoicelinkError::NodeCreationError(format!("{path}: {e}")))
    }

    fn player_endpoint(&self, session: &str, guild: GuildId) -> Result<Url> {
        self.endpoint(&format!("sessions/{session}/players/{guild}"))
    }
}

#[async_trait]
impl Transport for RestTransport {
    async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        let url = self.endpoint("loadtracks")?;
        let request = self.client.get(url).query(&[("identifier", identifier)]).send();

        process_request(request).await
    }

    async fn decode_track(&self, encoded: &str) -> Result<TrackData> {
        let url = self.endpoint("decodetrack")?;
        let request = self.client.get(url).query(&[("encodedTrack", encoded)]).send();

        process_request(request).await
    }

    async fn update_player(&self, session: &str, guild: GuildId, update: &PlayerUpdate) -> Result<()> {
        let url = self.player_endpoint(session, guild)?;
        let request = self
            .client
            .patch(url)
            .query(&[("noReplace", "false")])
            .json(update)
            .send();

        process_request::<IgnoredAny, _>(request).await.map(|_| ())
    }

    async fn destroy_player(&self, session: &str, guild: GuildId) -> Result<()> {
        let url = self.player_endpoint(session, guild)?;

        process_empty_request(self.client.delete(url).send()).await
    }

    async fn stats(&self) -> Result<NodeStats> {
        let url = self.endpoint("stats")?;

        process_request(self.client.get(url).send()).await
    }

    async fn update_session(&self, session: &str, state: &SessionState) -> Result<CurrentSessionState> {
        let url = self.endpoint(&format!("sessions/{session}"))?;
        let request = self.client.patch(url).json(state).send();

        process_request(request).await
    }
}

/// Indicate where the node stats update is coming from.
pub(crate) enum StatsUpdater {
    WebSocket,
    Endpoint,
}

fn is_url(query: &str) -> bool {
    static URL_REGEX: OnceLock<Option<Regex>> = OnceLock::new();

    URL_REGEX
        .get_or_init(|| Regex::new(r"^https?://(?:www\.)?\S+$").ok())
        .as_ref()
        .map_or(false, |regex| regex.is_match(query))
}

struct NodeRef {
    config: NodeConfig,
    options: NodeOptions,
    transport: Box<dyn Transport>,
    socket: Socket,
    session_id: RwLock<Option<String>>,
    available: AtomicBool,
    closed: AtomicBool,
    stats: RwLock<Option<NodeStats>>,
    latency: RwLock<Option<Duration>>,
    routes: scc::HashMap<GuildId, mpsc::UnboundedSender<PlayerEvent>>,
    penalty: FailurePenalty,
}

/// Handle to a node. Cloning it is cheap.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeRef>,
}

impl Node {
    /// Creates a node that talks to a Lavalink server over REST.
    pub fn new(config: NodeConfig, options: NodeOptions) -> Result<Self> {
        let transport = RestTransport::new(&config)?;
        Self::with_transport(config, options, Box::new(transport))
    }

    /// Creates a node with a custom request/response side.
    pub fn with_transport(
        config: NodeConfig,
        options: NodeOptions,
        transport: Box<dyn Transport>,
    ) -> Result<Self> {
        let socket = Socket::new(config.ws()?, options.bot_id, config.password.clone());

        let inner = NodeRef {
            config,
            options,
            transport,
            socket,
            session_id: RwLock::new(None),
            available: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stats: RwLock::new(None),
            latency: RwLock::new(None),
            routes: scc::HashMap::new(),
            penalty: FailurePenalty::new(),
        };

        Ok(Self { inner: Arc::new(inner) })
    }

    #[allow(missing_docs)]
    pub fn name(&self) -> &str {
        &self.inner.config.identifier
    }

    #[allow(missing_docs)]
    pub fn region(&self) -> Option<&str> {
        self.inner.config.region.as_deref()
    }

    #[allow(missing_docs)]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Returns true if the node session is open.
    pub fn available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Current session id.
    pub async fn session_id(&self) -> Result<String> {
        self.inner
            .session_id
            .read()
            .await
            .clone()
            .ok_or(VoicelinkError::NotConnected)
    }

    /// Opens the web socket session.
    ///
    /// Returns true if a previous session was resumed.
    pub async fn connect(&self) -> Result<bool> {
        self.inner.closed.store(false, Ordering::SeqCst);

        let resume = match self.inner.config.resume_timeout {
            Some(_) => self.inner.session_id.read().await.clone(),
            None => None,
        };

        let ready = self.inner.socket.connect(self.clone(), resume.as_deref()).await?;
        *self.inner.session_id.write().await = Some(ready.session_id.clone());

        if let Some(timeout) = self.inner.config.resume_timeout {
            let state = SessionState::resume_within(timeout);
            if let Err(e) = self.inner.transport.update_session(&ready.session_id, &state).await {
                warn!("node {} couldn't enable resuming: {e}", self.name());
            }
        }

        self.inner.available.store(true, Ordering::SeqCst);
        self.refresh_latency().await;

        info!(
            "node {} connected with session {} (resumed: {})",
            self.name(),
            ready.session_id,
            ready.resumed
        );
        if !ready.resumed && !self.inner.routes.is_empty() {
            warn!("node {} lost {} players with its previous session", self.name(), self.inner.routes.len());
        }

        Ok(ready.resumed)
    }

    /// Connects, retrying with [`ExponentialBackoff`] up to `retries` times.
    pub async fn connect_with_retries(&self, retries: u32) -> Result<bool> {
        let mut backoff = ExponentialBackoff::default();
        let mut attempt = 0;

        loop {
            match self.connect().await {
                Ok(resumed) => return Ok(resumed),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    let delay = backoff.delay();
                    warn!(
                        "node {} failed to connect ({e}), retry {attempt}/{retries} in {:.2}s",
                        self.name(),
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(VoicelinkError::NodeConnectionFailure(e.to_string())),
            }
        }
    }

    /// Closes the session. The node won't reconnect on its own.
    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.available.store(false, Ordering::SeqCst);
        self.inner.socket.close().await;

        info!("node {} disconnected", self.name());
    }

    /// Called by the socket reader when the stream ends on its own.
    pub(crate) fn connection_lost(&self) {
        self.inner.available.store(false, Ordering::SeqCst);
        if self.closed() {
            return;
        }

        warn!("node {} connection lost, reconnecting", self.name());

        let node = self.clone();
        spawn_fut(async move {
            let mut backoff = ExponentialBackoff::default();
            loop {
                tokio::time::sleep(backoff.delay()).await;
                if node.closed() {
                    break;
                }
                match node.connect().await {
                    Ok(_) => break,
                    Err(e) => warn!("node {} reconnect failed: {e}", node.name()),
                }
            }
        });
    }

    /// Update stats if the uptime of `new` is greater than the current one.
    ///
    /// Stats fetched from the endpoint don't carry frame stats, so the
    /// current ones are preserved.
    pub(crate) async fn update_stats(&self, mut new: NodeStats, kind: StatsUpdater) {
        let mut stats = self.inner.stats.write().await;

        if let Some(current) = stats.as_ref() {
            if current.uptime > new.uptime {
                return;
            }
            if matches!(kind, StatsUpdater::Endpoint) && new.frame_stats.is_none() {
                new.frame_stats = current.frame_stats;
            }
        }

        debug!("node {} stats: {} playing of {}", self.name(), new.players_active, new.players_total);
        *stats = Some(new);
    }

    /// Last stats reported by the node.
    pub async fn stats(&self) -> Option<NodeStats> {
        *self.inner.stats.read().await
    }

    /// Fetches the stats from the node REST API.
    pub async fn fetch_stats(&self) -> Result<NodeStats> {
        let stats = self.inner.transport.stats().await?;
        self.update_stats(stats, StatsUpdater::Endpoint).await;

        Ok(stats)
    }

    /// Last measured TCP connect time to the node.
    pub async fn latency(&self) -> Option<Duration> {
        *self.inner.latency.read().await
    }

    pub(crate) async fn refresh_latency(&self) {
        let latency = tcp_latency(&self.inner.config.host, self.inner.config.port, LATENCY_TIMEOUT).await;
        *self.inner.latency.write().await = latency;
    }

    pub(crate) async fn register_failure(&self, kind: FailureKind) {
        self.inner.penalty.register(kind).await;
    }

    /// Load score of this node. Lower is better.
    ///
    /// Nodes without stats score as if idle.
    pub async fn score(&self, weights: &LoadWeights) -> f64 {
        let stats = self.stats().await.unwrap_or_default();
        let failures = self.inner.penalty.recent_failures().await;

        weights.score(&stats, failures)
    }

    /// Resolves a query.
    ///
    /// Links and prefixed queries are sent as they are, anything else is
    /// searched with the default search engine.
    pub async fn search(&self, query: &str, requester: UserId) -> Result<SearchResult> {
        let query = query.trim();
        let identifier = if is_url(query) || SearchType::is_prefixed(query) {
            query.to_string()
        } else {
            self.inner.options.default_search.query(query)
        };

        if identifier.starts_with("spsearch:") && self.inner.options.spotify.is_none() {
            return Err(VoicelinkError::InvalidSpotifyClientAuthorization);
        }

        self.load(&identifier, requester).await
    }

    /// Searches `query` on spotify.
    pub async fn spotify_search(&self, query: &str, requester: UserId) -> Result<Vec<Track>> {
        if self.inner.options.spotify.is_none() {
            return Err(VoicelinkError::InvalidSpotifyClientAuthorization);
        }

        let result = self.load(&SearchType::Spsearch.query(query.trim()), requester).await?;
        Ok(result.into_tracks())
    }

    async fn load(&self, identifier: &str, requester: UserId) -> Result<SearchResult> {
        debug!("node {} loading `{identifier}`", self.name());

        let result = match self.inner.transport.load_tracks(identifier).await? {
            LoadResult::SingleTrack(track) => {
                SearchResult::Tracks(vec![Track::from_data(track, requester)])
            }
            LoadResult::Playlist(playlist) => {
                SearchResult::Playlist(Playlist::from_data(playlist, requester))
            }
            LoadResult::TracksSearch(tracks) => SearchResult::Tracks(
                tracks.into_iter().map(|track| Track::from_data(track, requester)).collect(),
            ),
            LoadResult::EmptyMatch(()) => SearchResult::Empty,
            LoadResult::Fail(exception) => {
                self.register_failure(FailureKind::LoadFailed).await;
                return Err(VoicelinkError::TrackLoadError(exception.to_string()));
            }
        };

        Ok(result)
    }

    /// Rebuilds a track from its token, asking the node if it can't be
    /// decoded locally.
    pub async fn decode_track(&self, token: &str, requester: UserId) -> Result<Track> {
        match Track::from_token(token, requester) {
            Ok(track) => Ok(track),
            Err(local) => {
                debug!("local decode failed ({local}), asking node {}", self.name());
                let data = self.inner.transport.decode_track(token).await?;
                Ok(Track::from_data(data, requester))
            }
        }
    }

    /// Sends `update` to the player of `guild`.
    pub async fn send(&self, guild: GuildId, update: &PlayerUpdate) -> Result<()> {
        if !self.available() {
            return Err(VoicelinkError::NodeNotAvailable(self.name().to_string()));
        }
        let session = self.session_id().await?;

        debug!("node {} update for {guild}: {update:?}", self.name());
        self.inner.transport.update_player(&session, guild, update).await
    }

    /// Destroys the player of `guild` on the node.
    pub async fn destroy_player(&self, guild: GuildId) -> Result<()> {
        let session = self.session_id().await?;
        self.inner.transport.destroy_player(&session, guild).await
    }

    /// Binds `guild` to this node, returning the channel its events go to.
    pub(crate) async fn route(&self, guild: GuildId) -> Result<mpsc::UnboundedReceiver<PlayerEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner
            .routes
            .insert_async(guild, tx)
            .await
            .map_err(|_| VoicelinkError::AlreadyConnected)?;

        Ok(rx)
    }

    /// Unbinds `guild`. Returns false if it wasn't bound.
    pub(crate) async fn unroute(&self, guild: GuildId) -> bool {
        self.inner.routes.remove_async(&guild).await.is_some()
    }

    /// Amount of players bound to this node.
    pub fn bound_players(&self) -> usize {
        self.inner.routes.len()
    }

    /// Forwards `event` to the player bound to `guild`, if any.
    pub(crate) async fn dispatch(&self, guild: GuildId, event: PlayerEvent) {
        let delivered = self
            .inner
            .routes
            .read_async(&guild, |_, tx| tx.send(event).is_ok())
            .await;

        if delivered != Some(true) {
            debug!("node {} dropped an event for unbound guild {guild}", self.name());
        }
    }

    #[cfg(test)]
    pub(crate) async fn mark_ready(&self, session: &str) {
        *self.inner.session_id.write().await = Some(session.to_string());
        self.inner.available.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn mark_unavailable(&self) {
        self.inner.available.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) async fn set_latency(&self, latency: Duration) {
        *self.inner.latency.write().await = Some(latency);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("available", &self.available())
            .finish()
    }
}
