//! Collaborators provided by the bot hosting the players.
//!
//! The chat platform (voice gateway, channel members) and the settings store
//! live outside this crate. Players reach them only through the traits
//! defined here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{Result, VoicelinkError};
use crate::model::{ChannelId, GuildId, UserId, VoiceState, Volume};

/// A user connected to a voice channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    #[allow(missing_docs)]
    pub id: UserId,
    /// Bots never count as listeners.
    pub bot: bool,
    /// Holds a moderation capability (e.g. manage guild or a DJ role).
    pub moderator: bool,
}

impl Member {
    /// A regular listener.
    pub fn listener(id: UserId) -> Self {
        Self { id, bot: false, moderator: false }
    }

    /// A listener with moderation capabilities.
    pub fn moderator(id: UserId) -> Self {
        Self { id, bot: false, moderator: true }
    }
}

/// Decides if `member` may skip voting, given everyone in the channel.
pub type PrivilegeCheck = Arc<dyn Fn(&Member, &[Member]) -> bool + Send + Sync>;

/// Moderators and members alone with the bot are privileged.
pub fn default_privilege() -> PrivilegeCheck {
    Arc::new(|member: &Member, listeners: &[Member]| {
        if member.moderator {
            return true;
        }

        let mut humans = listeners.iter().filter(|listener| !listener.bot);
        matches!((humans.next(), humans.next()), (Some(only), None) if only.id == member.id)
    })
}

/// Voice signaling provided by the chat platform.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// Joins `channel` and returns the voice state the node needs.
    async fn join(&self, guild: GuildId, channel: ChannelId) -> Result<VoiceState>;

    /// Leaves the voice channel of `guild`.
    async fn leave(&self, guild: GuildId) -> Result<()>;

    /// Members currently in `channel`, bots included.
    async fn members(&self, guild: GuildId, channel: ChannelId) -> Result<Vec<Member>>;
}

fn default_lang() -> String {
    "EN".to_string()
}

fn default_queue_type() -> String {
    "Queue".to_string()
}

fn default_volume() -> Volume {
    100
}

fn default_true() -> bool {
    true
}

/// Guild settings the players read.
///
/// Unknown keys are kept in `extra` and written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildSettings {
    #[allow(missing_docs)]
    #[serde(default)]
    pub prefix: Option<String>,
    #[allow(missing_docs)]
    #[serde(default = "default_lang")]
    pub lang: String,
    /// `Queue` or `FairQueue`.
    #[serde(rename = "queueType", default = "default_queue_type")]
    pub queue_type: String,
    /// Volume a new player starts with.
    #[serde(default = "default_volume")]
    pub volume: Volume,
    /// Whether the command layer shows the interactive controller.
    #[serde(default = "default_true")]
    pub controller: bool,
    /// Whether the same track may be queued twice.
    #[serde(rename = "duplicateTrack", default)]
    pub duplicate_track: bool,
    /// Queue related tracks when the queue runs dry.
    #[serde(default)]
    pub autoplay: bool,
    /// Every listener acts as privileged.
    #[serde(rename = "votedisable", default)]
    pub vote_disable: bool,
    #[allow(missing_docs)]
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GuildSettings {
    /// Whether the queue interleaves requesters.
    pub fn fair_queue(&self) -> bool {
        self.queue_type.eq_ignore_ascii_case("FairQueue")
    }
}

impl Default for GuildSettings {
    fn default() -> Self {
        Self {
            prefix: None,
            lang: default_lang(),
            queue_type: default_queue_type(),
            volume: default_volume(),
            controller: true,
            duplicate_track: false,
            autoplay: false,
            vote_disable: false,
            extra: Map::new(),
        }
    }
}

/// Per user document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDocument {
    #[allow(missing_docs)]
    #[serde(default)]
    pub email: Option<String>,
    /// Tokens of the last played tracks, most recent last.
    #[serde(default)]
    pub history: Vec<String>,
    #[allow(missing_docs)]
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Key-value document store holding guild settings and user documents.
///
/// Updates are partial: only the given keys change.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    #[allow(missing_docs)]
    async fn guild_settings(&self, guild: GuildId) -> Result<GuildSettings>;

    #[allow(missing_docs)]
    async fn update_guild_settings(&self, guild: GuildId, changes: Map<String, Value>) -> Result<()>;

    #[allow(missing_docs)]
    async fn user(&self, user: UserId) -> Result<UserDocument>;

    #[allow(missing_docs)]
    async fn update_user(&self, user: UserId, changes: Map<String, Value>) -> Result<()>;

    /// Appends `token` to the user history, keeping the last `limit` entries.
    ///
    /// The default reads then writes the document, so concurrent pushes for
    /// the same user may drop entries. The bundled stores override it.
    async fn push_history(&self, user: UserId, token: String, limit: usize) -> Result<()> {
        let mut history = self.user(user).await?.history;
        history.push(token);
        if history.len() > limit {
            history.drain(..history.len() - limit);
        }

        let mut changes = Map::new();
        changes.insert("history".to_string(), Value::from(history));
        self.update_user(user, changes).await
    }
}

fn empty() -> Value {
    Value::Object(Map::new())
}

fn as_fields(document: &mut Value) -> Option<&mut Map<String, Value>> {
    if !document.is_object() {
        *document = empty();
    }
    document.as_object_mut()
}

fn merge(document: &mut Value, changes: Map<String, Value>) {
    if let Some(fields) = as_fields(document) {
        fields.extend(changes);
    }
}

fn append_history(document: &mut Value, token: String, limit: usize) {
    let Some(fields) = as_fields(document) else {
        return;
    };
    let history = fields
        .entry("history")
        .or_insert_with(|| Value::Array(Vec::new()));
    if !history.is_array() {
        *history = Value::Array(Vec::new());
    }

    if let Value::Array(entries) = history {
        entries.push(Value::String(token));
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
    }
}

/// Missing and null documents read as empty ones.
fn parse<T: serde::de::DeserializeOwned>(document: Option<&Value>) -> Result<T> {
    let document = match document {
        None | Some(Value::Null) => empty(),
        Some(document) => document.clone(),
    };
    serde_json::from_value(document).map_err(|e| VoicelinkError::StoreError(e.to_string()))
}

/// Store kept in memory.
#[derive(Default)]
pub struct MemoryStore {
    guilds: RwLock<HashMap<GuildId, Value>>,
    users: RwLock<HashMap<UserId, Value>>,
}

impl MemoryStore {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn guild_settings(&self, guild: GuildId) -> Result<GuildSettings> {
        parse(self.guilds.read().await.get(&guild))
    }

    async fn update_guild_settings(&self, guild: GuildId, changes: Map<String, Value>) -> Result<()> {
        let mut guilds = self.guilds.write().await;
        merge(guilds.entry(guild).or_insert_with(empty), changes);
        Ok(())
    }

    async fn user(&self, user: UserId) -> Result<UserDocument> {
        parse(self.users.read().await.get(&user))
    }

    async fn update_user(&self, user: UserId, changes: Map<String, Value>) -> Result<()> {
        let mut users = self.users.write().await;
        merge(users.entry(user).or_insert_with(empty), changes);
        Ok(())
    }

    async fn push_history(&self, user: UserId, token: String, limit: usize) -> Result<()> {
        let mut users = self.users.write().await;
        append_history(users.entry(user).or_insert_with(empty), token, limit);
        Ok(())
    }
}

/// Store writing one json file per guild and per user under a directory.
///
/// Documents are cached after the first read.
pub struct JsonStore {
    dir: PathBuf,
    cache: MemoryStore,
}

impl JsonStore {
    /// Opens (and creates if needed) the store directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(store_error)?;

        info!("json store opened at {}", dir.display());

        Ok(Self { dir, cache: MemoryStore::new() })
    }

    fn guild_path(&self, guild: GuildId) -> PathBuf {
        self.dir.join(format!("guild_{guild}.json"))
    }

    fn user_path(&self, user: UserId) -> PathBuf {
        self.dir.join(format!("user_{user}.json"))
    }

    async fn load(path: &Path) -> Result<Option<Value>> {
        match fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| VoicelinkError::StoreError(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(store_error(e)),
        }
    }

    async fn save(path: &Path, document: &Value) -> Result<()> {
        let content = serde_json::to_string_pretty(document)
            .map_err(|e| VoicelinkError::StoreError(e.to_string()))?;
        fs::write(path, content).await.map_err(store_error)?;

        debug!("saved {}", path.display());
        Ok(())
    }

    async fn cached_guild(&self, guild: GuildId) -> Result<()> {
        if self.cache.guilds.read().await.contains_key(&guild) {
            return Ok(());
        }
        let document = Self::load(&self.guild_path(guild)).await?.unwrap_or_else(empty);
        self.cache.guilds.write().await.entry(guild).or_insert(document);
        Ok(())
    }

    async fn cached_user(&self, user: UserId) -> Result<()> {
        if self.cache.users.read().await.contains_key(&user) {
            return Ok(());
        }
        let document = Self::load(&self.user_path(user)).await?.unwrap_or_else(empty);
        self.cache.users.write().await.entry(user).or_insert(document);
        Ok(())
    }
}

fn store_error(e: std::io::Error) -> VoicelinkError {
    VoicelinkError::StoreError(e.to_string())
}

#[async_trait]
impl SettingsStore for JsonStore {
    async fn guild_settings(&self, guild: GuildId) -> Result<GuildSettings> {
        self.cached_guild(guild).await?;
        self.cache.guild_settings(guild).await
    }

    async fn update_guild_settings(&self, guild: GuildId, changes: Map<String, Value>) -> Result<()> {
        self.cached_guild(guild).await?;

        let mut guilds = self.cache.guilds.write().await;
        let document = guilds.entry(guild).or_insert_with(empty);
        merge(document, changes);
        Self::save(&self.guild_path(guild), document).await
    }

    async fn user(&self, user: UserId) -> Result<UserDocument> {
        self.cached_user(user).await?;
        self.cache.user(user).await
    }

    async fn update_user(&self, user: UserId, changes: Map<String, Value>) -> Result<()> {
        self.cached_user(user).await?;

        let mut users = self.cache.users.write().await;
        let document = users.entry(user).or_insert_with(empty);
        merge(document, changes);
        Self::save(&self.user_path(user), document).await
    }

    async fn push_history(&self, user: UserId, token: String, limit: usize) -> Result<()> {
        self.cached_user(user).await?;

        let mut users = self.cache.users.write().await;
        let document = users.entry(user).or_insert_with(empty);
        append_history(document, token, limit);
        Self::save(&self.user_path(user), document).await
    }
}

/// Everything a player needs from the host bot.
#[derive(Clone)]
pub struct Host {
    #[allow(missing_docs)]
    pub gateway: Arc<dyn VoiceGateway>,
    #[allow(missing_docs)]
    pub store: Arc<dyn SettingsStore>,
    #[allow(missing_docs)]
    pub privilege: PrivilegeCheck,
}

impl Host {
    /// Uses [`default_privilege`] to decide who skips voting.
    pub fn new(gateway: Arc<dyn VoiceGateway>, store: Arc<dyn SettingsStore>) -> Self {
        Self { gateway, store, privilege: default_privilege() }
    }

    /// Replaces the privilege check.
    pub fn with_privilege(mut self, privilege: PrivilegeCheck) -> Self {
        self.privilege = privilege;
        self
    }
}
