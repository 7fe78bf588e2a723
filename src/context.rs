//! Application context.
//!
//! [`Voicelink`] owns everything a bot needs to run players: the config, the
//! node pool, the host collaborators and a cache of guild settings. Build one
//! at startup and share it with the command handlers.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use voicelink::config::VoicelinkConfig;
//! # use voicelink::context::Voicelink;
//! # use voicelink::host::{Host, JsonStore, VoiceGateway};
//! # #[allow(dead_code)]
//! # async fn example(gateway: Arc<dyn VoiceGateway>) -> voicelink::error::Result<()> {
//! let config = VoicelinkConfig::load("settings.json")?;
//! let store = Arc::new(JsonStore::open("data").await?);
//! let voicelink = Voicelink::new(1234, config, Host::new(gateway, store));
//!
//! voicelink.start_nodes().await?;
//! let _player = voicelink.connect_channel(1, 2).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use log::{error, info};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::config::VoicelinkConfig;
use crate::error::{Result, VoicelinkError};
use crate::host::{GuildSettings, Host, SettingsStore, VoiceGateway};
use crate::model::{ChannelId, GuildId, UserId};
use crate::node::NodeOptions;
use crate::player::{Player, PlayerConfig};
use crate::pool::{NodeAlgorithm, NodePool};

/// Everything the players of a bot share.
pub struct Voicelink {
    config: VoicelinkConfig,
    pool: NodePool,
    host: Host,
    settings: RwLock<HashMap<GuildId, GuildSettings>>,
}

impl Voicelink {
    /// Builds the context. Nodes aren't connected until
    /// [`Voicelink::start_nodes`].
    pub fn new(bot_id: UserId, config: VoicelinkConfig, host: Host) -> Self {
        let options = NodeOptions {
            bot_id,
            default_search: config.default_search,
            spotify: config.spotify.clone(),
        };
        let pool = NodePool::new(options, config.weights, config.connect_retries);

        Self {
            config,
            pool,
            host,
            settings: RwLock::new(HashMap::new()),
        }
    }

    #[allow(missing_docs)]
    pub fn config(&self) -> &VoicelinkConfig {
        &self.config
    }

    #[allow(missing_docs)]
    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    #[allow(missing_docs)]
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Connects every configured node.
    ///
    /// Nodes that fail are logged and skipped. Fails only if none connected.
    pub async fn start_nodes(&self) -> Result<usize> {
        let mut connected = 0;

        for config in self.config.nodes.values() {
            match self.pool.create_node(config.clone()).await {
                Ok(_) => connected += 1,
                Err(e) => error!("{e}"),
            }
        }

        if connected == 0 {
            return Err(VoicelinkError::NoNodesAvailable);
        }

        info!("{connected}/{} nodes connected", self.config.nodes.len());
        Ok(connected)
    }

    /// Drops every cached guild setting. Called when the bot (re)connects to
    /// the chat platform.
    pub async fn clear_on_ready(&self) {
        self.settings.write().await.clear();
    }

    /// Settings of `guild`, read from the store on the first call.
    pub async fn settings(&self, guild: GuildId) -> Result<GuildSettings> {
        if let Some(settings) = self.settings.read().await.get(&guild) {
            return Ok(settings.clone());
        }

        let settings = self.host.store.guild_settings(guild).await?;
        self.settings.write().await.insert(guild, settings.clone());

        Ok(settings)
    }

    /// Writes `changes` and forgets the cached settings of `guild`.
    pub async fn update_settings(&self, guild: GuildId, changes: Map<String, Value>) -> Result<()> {
        self.host.store.update_guild_settings(guild, changes).await?;
        self.settings.write().await.remove(&guild);

        Ok(())
    }

    /// Player of `guild`.
    pub async fn player(&self, guild: GuildId) -> Result<Player> {
        self.pool.get_player(guild).await.ok_or(VoicelinkError::PlayerNotFound)
    }

    fn player_config(&self) -> PlayerConfig {
        PlayerConfig {
            queue: self.config.queue,
            stuck_grace: self.config.stuck_grace(),
            history_limit: self.config.history_limit,
            ..Default::default()
        }
    }

    /// Joins `channel` and creates the player of `guild` on the best node.
    pub async fn connect_channel(&self, guild: GuildId, channel: ChannelId) -> Result<Player> {
        if self.pool.get_player(guild).await.is_some() {
            return Err(VoicelinkError::AlreadyConnected);
        }

        let node = self.pool.get_node(None, &NodeAlgorithm::ByPing).await?;
        let settings = self.settings(guild).await?;
        let voice = self.host.gateway.join(guild, channel).await?;

        let player = Player::new(
            guild,
            channel,
            node,
            self.host.clone(),
            &settings,
            self.player_config(),
            self.pool.downgrade(),
        )
        .await?;

        if let Err(e) = self.pool.insert_player(player.clone()).await {
            player.abandon().await;
            return Err(e);
        }
        if let Err(e) = player.connect(voice).await {
            player.teardown().await;
            return Err(e);
        }

        info!("guild {guild} connected to channel {channel}");
        Ok(player)
    }

    /// Tears down every player and disconnects every node.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        self.clear_on_ready().await;
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::host::{Member, MemoryStore};
    use crate::model::VoiceState;
    use crate::node::mock::{ready_node, MockTransport};

    struct Gateway;

    #[async_trait]
    impl VoiceGateway for Gateway {
        async fn join(&self, _: GuildId, channel: ChannelId) -> Result<VoiceState> {
            Ok(VoiceState {
                token: "token".to_string(),
                endpoint: format!("endpoint-{channel}"),
                session_id: "voice".to_string(),
            })
        }

        async fn leave(&self, _: GuildId) -> Result<()> {
            Ok(())
        }

        async fn members(&self, _: GuildId, _: ChannelId) -> Result<Vec<Member>> {
            Ok(vec![Member::listener(1)])
        }
    }

    fn voicelink() -> Voicelink {
        let config = VoicelinkConfig::from_json(
            r#"{ "nodes": { "main": { "host": "127.0.0.1", "port": 2333, "password": "pass" } } }"#,
        )
        .unwrap();
        let host = Host::new(Arc::new(Gateway), Arc::new(MemoryStore::new()));

        Voicelink::new(1, config, host)
    }

    fn changes(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_connect_channel() {
        let voicelink = voicelink();
        let transport = MockTransport::default();
        let updates = transport.updates.clone();
        voicelink.pool().register_node(ready_node("main", transport).await).await.unwrap();
        voicelink.update_settings(5, changes(json!({ "volume": 70 }))).await.unwrap();

        let player = voicelink.connect_channel(5, 6).await.unwrap();

        assert_eq!(player.channel(), 6);
        assert!(voicelink.player(5).await.is_ok());
        assert!(matches!(
            voicelink.connect_channel(5, 6).await,
            Err(VoicelinkError::AlreadyConnected)
        ));

        let updates = updates.lock().unwrap().clone();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.volume, Some(70));
        assert_eq!(updates[0].1.voice.as_ref().unwrap().endpoint, "endpoint-6");
    }

    #[tokio::test]
    async fn test_connect_without_nodes() {
        let voicelink = voicelink();

        assert!(matches!(
            voicelink.connect_channel(5, 6).await,
            Err(VoicelinkError::NoNodesAvailable)
        ));
        assert!(matches!(voicelink.player(5).await, Err(VoicelinkError::PlayerNotFound)));
    }

    #[tokio::test]
    async fn test_settings_cache() {
        let voicelink = voicelink();

        assert_eq!(voicelink.settings(1).await.unwrap().volume, 100);
        voicelink.update_settings(1, changes(json!({ "volume": 40 }))).await.unwrap();
        assert_eq!(voicelink.settings(1).await.unwrap().volume, 40);

        voicelink.host().store.update_guild_settings(1, changes(json!({ "volume": 10 }))).await.unwrap();
        assert_eq!(voicelink.settings(1).await.unwrap().volume, 40, "served from cache");

        voicelink.clear_on_ready().await;
        assert_eq!(voicelink.settings(1).await.unwrap().volume, 10);
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_players() {
        let voicelink = voicelink();
        let node = ready_node("main", MockTransport::default()).await;
        voicelink.pool().register_node(node.clone()).await.unwrap();
        let player = voicelink.connect_channel(5, 6).await.unwrap();

        voicelink.shutdown().await;

        assert!(player.is_torn_down().await);
        assert_eq!(node.bound_players(), 0);
        assert!(voicelink.pool().nodes().await.is_empty());
    }
}
