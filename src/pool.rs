//! Registry of nodes and of the players bound to them.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::RwLock;

use crate::error::{Result, VoicelinkError};
use crate::model::GuildId;
use crate::node::{Node, NodeConfig, NodeName, NodeOptions};
use crate::penalty::LoadWeights;
use crate::player::Player;

/// How a node is picked when no name is given.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NodeAlgorithm {
    /// Least load score, ties broken by the lowest latency.
    #[default]
    ByPing,
    /// Best node among the ones tagged with this region. Falls back to
    /// [`NodeAlgorithm::ByPing`] over every node if none is available there.
    ByRegion(String),
}

struct NodePoolRef {
    options: NodeOptions,
    weights: LoadWeights,
    retries: u32,
    nodes: RwLock<HashMap<NodeName, Node>>,
    players: RwLock<HashMap<GuildId, Player>>,
}

/// Process wide set of nodes. Cloning it is cheap.
#[derive(Clone)]
pub struct NodePool {
    inner: Arc<NodePoolRef>,
}

/// Non owning pool handle kept by players.
#[derive(Clone)]
pub(crate) struct WeakPool(Weak<NodePoolRef>);

impl WeakPool {
    pub(crate) fn upgrade(&self) -> Option<NodePool> {
        self.0.upgrade().map(|inner| NodePool { inner })
    }
}

impl NodePool {
    /// Creates an empty pool.
    ///
    /// `retries` is the amount of reconnection attempts a new node gets
    /// before [`NodePool::create_node`] gives up.
    pub fn new(options: NodeOptions, weights: LoadWeights, retries: u32) -> Self {
        let inner = NodePoolRef {
            options,
            weights,
            retries,
            nodes: RwLock::new(HashMap::new()),
            players: RwLock::new(HashMap::new()),
        };

        Self { inner: Arc::new(inner) }
    }

    pub(crate) fn downgrade(&self) -> WeakPool {
        WeakPool(Arc::downgrade(&self.inner))
    }

    #[allow(missing_docs)]
    pub fn weights(&self) -> &LoadWeights {
        &self.inner.weights
    }

    /// Connects a new node and registers it under its identifier.
    pub async fn create_node(&self, config: NodeConfig) -> Result<Node> {
        let name = config.identifier.clone();
        if self.inner.nodes.read().await.contains_key(&name) {
            return Err(VoicelinkError::NodeCreationError(format!("node `{name}` already exists")));
        }

        let node = Node::new(config, self.inner.options.clone())?;
        node.connect_with_retries(self.inner.retries)
            .await
            .map_err(|e| VoicelinkError::NodeCreationError(format!("node `{name}`: {e}")))?;

        if let Err(e) = self.register_node(node.clone()).await {
            node.disconnect().await;
            return Err(e);
        }

        info!("node {name} created");
        Ok(node)
    }

    /// Registers an already built node.
    pub async fn register_node(&self, node: Node) -> Result<()> {
        let mut nodes = self.inner.nodes.write().await;
        if nodes.contains_key(node.name()) {
            return Err(VoicelinkError::NodeCreationError(format!(
                "node `{}` already exists",
                node.name()
            )));
        }

        nodes.insert(node.name().to_string(), node);
        Ok(())
    }

    /// Removes a node, tearing down every player bound to it.
    pub async fn remove_node(&self, name: &str) -> Result<()> {
        let node = self
            .inner
            .nodes
            .write()
            .await
            .remove(name)
            .ok_or_else(|| VoicelinkError::NodeNotAvailable(name.to_string()))?;

        for player in self.players().await {
            if player.node().name() == name {
                player.teardown().await;
            }
        }
        node.disconnect().await;

        info!("node {name} removed");
        Ok(())
    }

    /// Returns the node called `name`, or the best available one.
    pub async fn get_node(&self, name: Option<&str>, algorithm: &NodeAlgorithm) -> Result<Node> {
        if let Some(name) = name {
            return match self.inner.nodes.read().await.get(name) {
                Some(node) if node.available() => Ok(node.clone()),
                _ => Err(VoicelinkError::NodeNotAvailable(name.to_string())),
            };
        }

        let available: Vec<Node> = self
            .inner
            .nodes
            .read()
            .await
            .values()
            .filter(|node| node.available())
            .cloned()
            .collect();

        if let NodeAlgorithm::ByRegion(region) = algorithm {
            let local: Vec<Node> = available
                .iter()
                .filter(|node| node.region() == Some(region.as_str()))
                .cloned()
                .collect();

            if !local.is_empty() {
                return self.least_loaded(local).await;
            }
            debug!("no nodes available in region {region}");
        }

        self.least_loaded(available).await
    }

    /// Shortcut of [`NodePool::get_node`] with [`NodeAlgorithm::ByRegion`].
    pub async fn get_node_by_region(&self, region: &str) -> Result<Node> {
        self.get_node(None, &NodeAlgorithm::ByRegion(region.to_string()))
            .await
    }

    async fn least_loaded(&self, nodes: Vec<Node>) -> Result<Node> {
        let mut best: Option<(f64, Duration, Node)> = None;

        for node in nodes {
            let score = node.score(&self.inner.weights).await;
            let latency = node.latency().await.unwrap_or(Duration::MAX);

            let better = match &best {
                Some((best_score, best_latency, _)) => {
                    score < *best_score || (score == *best_score && latency < *best_latency)
                }
                None => true,
            };
            if better {
                best = Some((score, latency, node));
            }
        }

        best.map(|(_, _, node)| node).ok_or(VoicelinkError::NoNodesAvailable)
    }

    /// Every registered node.
    pub async fn nodes(&self) -> Vec<Node> {
        self.inner.nodes.read().await.values().cloned().collect()
    }

    #[allow(missing_docs)]
    pub async fn get_player(&self, guild: GuildId) -> Option<Player> {
        self.inner.players.read().await.get(&guild).cloned()
    }

    /// Every live player.
    pub async fn players(&self) -> Vec<Player> {
        self.inner.players.read().await.values().cloned().collect()
    }

    pub(crate) async fn insert_player(&self, player: Player) -> Result<()> {
        let mut players = self.inner.players.write().await;
        if players.contains_key(&player.guild()) {
            return Err(VoicelinkError::AlreadyConnected);
        }

        players.insert(player.guild(), player);
        Ok(())
    }

    /// Removes `player` if it's still the one registered for its guild.
    pub(crate) async fn remove_player(&self, player: &Player) -> bool {
        let mut players = self.inner.players.write().await;

        let registered = players
            .get(&player.guild())
            .map_or(false, |current| current.same(player));
        if registered {
            players.remove(&player.guild());
        }

        registered
    }

    /// Tears down every player and disconnects every node.
    pub async fn shutdown(&self) {
        for player in self.players().await {
            player.teardown().await;
        }

        let nodes: Vec<Node> = self.inner.nodes.write().await.drain().map(|(_, node)| node).collect();
        for node in nodes {
            node.disconnect().await;
        }

        if !self.inner.players.read().await.is_empty() {
            error!("players left behind after shutdown");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{Cpu, NodeStats};
    use crate::node::mock::{ready_node, MockTransport};
    use crate::node::StatsUpdater;

    fn stats(system_load: f64, players_active: u64) -> NodeStats {
        NodeStats {
            players_active,
            players_total: players_active,
            uptime: 1,
            cpu: Cpu { cores: 4, system_load, process_load: 0.0 },
            ..Default::default()
        }
    }

    async fn pool_with(nodes: Vec<Node>) -> NodePool {
        let pool = NodePool::new(NodeOptions::default(), LoadWeights::default(), 0);
        for node in nodes {
            pool.register_node(node).await.unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn test_least_loaded_node_is_picked() {
        let a = ready_node("a", MockTransport::default()).await;
        let b = ready_node("b", MockTransport::default()).await;
        a.update_stats(stats(0.2, 10), StatsUpdater::WebSocket).await;
        b.update_stats(stats(0.8, 2), StatsUpdater::WebSocket).await;
        let pool = pool_with(vec![a, b]).await;

        for _ in 0..5 {
            let node = pool.get_node(None, &NodeAlgorithm::ByPing).await.unwrap();
            assert_eq!(node.name(), "a");
        }
    }

    #[tokio::test]
    async fn test_latency_breaks_ties() {
        let a = ready_node("a", MockTransport::default()).await;
        let b = ready_node("b", MockTransport::default()).await;
        a.set_latency(Duration::from_millis(80)).await;
        b.set_latency(Duration::from_millis(20)).await;
        let pool = pool_with(vec![a, b]).await;

        let node = pool.get_node(None, &NodeAlgorithm::ByPing).await.unwrap();

        assert_eq!(node.name(), "b");
    }

    #[tokio::test]
    async fn test_unavailable_nodes_arent_picked() {
        let a = ready_node("a", MockTransport::default()).await;
        let b = ready_node("b", MockTransport::default()).await;
        a.mark_unavailable();
        b.mark_unavailable();
        let pool = pool_with(vec![a, b]).await;

        assert!(matches!(
            pool.get_node(None, &NodeAlgorithm::ByPing).await,
            Err(VoicelinkError::NoNodesAvailable)
        ));
        assert!(matches!(
            pool.get_node(Some("a"), &NodeAlgorithm::ByPing).await,
            Err(VoicelinkError::NodeNotAvailable(_))
        ));
        assert!(matches!(
            pool_with(vec![]).await.get_node(None, &NodeAlgorithm::ByPing).await,
            Err(VoicelinkError::NoNodesAvailable)
        ));
    }

    #[tokio::test]
    async fn test_region_selection_falls_back() {
        let mut config = crate::node::mock::config("eu");
        config.region = Some("europe".to_string());
        let eu = Node::with_transport(config, NodeOptions::default(), Box::new(MockTransport::default())).unwrap();
        eu.mark_ready("session").await;
        eu.update_stats(stats(0.9, 40), StatsUpdater::WebSocket).await;
        let us = ready_node("us", MockTransport::default()).await;
        let pool = pool_with(vec![eu, us]).await;

        assert_eq!(pool.get_node_by_region("europe").await.unwrap().name(), "eu");
        assert_eq!(pool.get_node_by_region("asia").await.unwrap().name(), "us");
    }

    #[tokio::test]
    async fn test_duplicated_names_are_rejected() {
        let pool = pool_with(vec![ready_node("a", MockTransport::default()).await]).await;

        let result = pool.register_node(ready_node("a", MockTransport::default()).await).await;

        assert!(matches!(result, Err(VoicelinkError::NodeCreationError(_))));
        assert!(matches!(
            pool.create_node(crate::node::mock::config("a")).await,
            Err(VoicelinkError::NodeCreationError(_))
        ));
        assert_eq!(pool.nodes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_node_fails_after_retries() {
        let pool = NodePool::new(NodeOptions::default(), LoadWeights::default(), 1);
        let config = NodeConfig {
            port: 1,
            ..crate::node::mock::config("down")
        };

        let result = pool.create_node(config).await;

        assert!(matches!(result, Err(VoicelinkError::NodeCreationError(_))), "got {result:?}");
        assert!(pool.nodes().await.is_empty());
    }
}
