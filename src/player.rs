//! Per guild playback.
//!
//! A [`Player`] is bound to one voice channel and one node. Every command and
//! every node event takes the player lock for its whole handling, network
//! round trips included, so they never interleave on the same guild.
//!
//! Gated actions (pause, resume, skip, back, shuffle and leave) run right
//! away for privileged members. Everyone else votes, and the action runs once
//! enough distinct listeners agreed. Votes are dropped on every track change.

use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, Mutex, MutexGuard};

use crate::error::{Result, VoicelinkError};
use crate::event::{PlayerEvent, PlayerNotice};
use crate::filters::{Filter, Filters, Preset};
use crate::host::{GuildSettings, Host, Member, SettingsStore, VoiceGateway};
use crate::model::{
    ChannelId, GuildId, Milli, PlayerUpdate, TrackEndReason, UserId, VoiceState, Volume,
};
use crate::node::Node;
use crate::penalty::FailureKind;
use crate::pool::WeakPool;
use crate::queue::{LoopMode, Queue, QueueConfig, ShuffleTarget};
use crate::track::{SearchResult, Source, Track};
use crate::utils::spawn_fut;
use crate::vote::{self, VoteAction, VoteOutcome, Votes};

/// Max volume a player accepts.
pub const MAX_VOLUME: Volume = 150;

const NOTICE_CAPACITY: usize = 32;

/// Settings every player of a process shares.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Base queue policies. Guild settings may override duplicates and fairness.
    pub queue: QueueConfig,
    /// Wait before skipping a stuck track.
    pub stuck_grace: Duration,
    /// Wait before skipping a track that raised an exception.
    pub exception_grace: Duration,
    /// Tracks kept in each user's persisted history.
    pub history_limit: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            stuck_grace: Duration::from_secs(10),
            exception_grace: Duration::from_secs(5),
            history_limit: 25,
        }
    }
}

struct PlaybackState {
    queue: Queue,
    /// A track was sent to the node and didn't end yet.
    playing: bool,
    paused: bool,
    position: Milli,
    volume: Volume,
    filters: Filters,
    votes: Votes,
    stuck: bool,
    /// Bumped on every advance, so delayed skips can tell they're stale.
    seq: u64,
    autoplay: bool,
    vote_disabled: bool,
    torn_down: bool,
}

impl PlaybackState {
    fn is_current(&self, encoded: &str) -> bool {
        self.playing && self.queue.current().map_or(false, |track| track.encoded == encoded)
    }
}

/// Read only copy of the player state.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct PlayerSnapshot {
    pub guild: GuildId,
    pub channel: ChannelId,
    pub node: String,
    pub queue: Queue,
    pub playing: bool,
    pub paused: bool,
    pub position: Milli,
    pub volume: Volume,
    pub filters: Vec<String>,
    pub autoplay: bool,
}

impl PlayerSnapshot {
    #[allow(missing_docs)]
    pub fn current(&self) -> Option<&Track> {
        self.queue.current()
    }

    #[allow(missing_docs)]
    pub fn repeat(&self) -> LoopMode {
        self.queue.repeat()
    }
}

struct PlayerRef {
    guild: GuildId,
    channel: ChannelId,
    node: Node,
    host: Host,
    pool: WeakPool,
    config: PlayerConfig,
    notices: broadcast::Sender<PlayerNotice>,
    state: Mutex<PlaybackState>,
}

/// Handle to the player of a guild. Cloning it is cheap.
#[derive(Clone)]
pub struct Player {
    inner: Arc<PlayerRef>,
}

impl Player {
    /// Binds a new player for `guild` to `node` and starts consuming its
    /// events.
    pub(crate) async fn new(
        guild: GuildId,
        channel: ChannelId,
        node: Node,
        host: Host,
        settings: &GuildSettings,
        config: PlayerConfig,
        pool: WeakPool,
    ) -> Result<Self> {
        let events = node.route(guild).await?;

        let mut queue_config = config.queue;
        queue_config.allow_duplicate = settings.duplicate_track;
        queue_config.fair = queue_config.fair || settings.fair_queue();

        let state = PlaybackState {
            queue: Queue::new(queue_config),
            playing: false,
            paused: false,
            position: 0,
            volume: settings.volume.min(MAX_VOLUME),
            filters: Filters::default(),
            votes: Votes::default(),
            stuck: false,
            seq: 0,
            autoplay: settings.autoplay,
            vote_disabled: settings.vote_disable,
            torn_down: false,
        };

        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let inner = PlayerRef {
            guild,
            channel,
            node,
            host,
            pool,
            config,
            notices,
            state: Mutex::new(state),
        };
        let player = Self { inner: Arc::new(inner) };

        listen(Arc::downgrade(&player.inner), events);
        info!("player for guild {guild} bound to node {}", player.inner.node.name());

        Ok(player)
    }

    #[allow(missing_docs)]
    pub fn guild(&self) -> GuildId {
        self.inner.guild
    }

    #[allow(missing_docs)]
    pub fn channel(&self) -> ChannelId {
        self.inner.channel
    }

    /// Node the player is bound to.
    pub fn node(&self) -> &Node {
        &self.inner.node
    }

    pub(crate) fn same(&self, other: &Player) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Receives the notices published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerNotice> {
        self.inner.notices.subscribe()
    }

    fn notify(&self, notice: PlayerNotice) {
        // Nobody listening is fine.
        let _ = self.inner.notices.send(notice);
    }

    async fn lock(&self) -> Result<MutexGuard<'_, PlaybackState>> {
        let state = self.inner.state.lock().await;
        if state.torn_down {
            return Err(VoicelinkError::PlayerTornDown);
        }
        Ok(state)
    }

    async fn send(&self, update: &PlayerUpdate) -> Result<()> {
        self.inner.node.send(self.inner.guild, update).await
    }

    /// Hands the voice session to the node, along with the start volume.
    pub(crate) async fn connect(&self, voice: VoiceState) -> Result<()> {
        let state = self.lock().await?;
        let update = PlayerUpdate {
            voice: Some(voice),
            volume: Some(state.volume),
            ..Default::default()
        };

        self.send(&update).await
    }

    /// Returns true if the player was torn down.
    pub async fn is_torn_down(&self) -> bool {
        self.inner.state.lock().await.torn_down
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> PlayerSnapshot {
        let state = self.inner.state.lock().await;

        PlayerSnapshot {
            guild: self.inner.guild,
            channel: self.inner.channel,
            node: self.inner.node.name().to_string(),
            queue: state.queue.clone(),
            playing: state.playing,
            paused: state.paused,
            position: state.position,
            volume: state.volume,
            filters: state.filters.tags().into_iter().map(str::to_string).collect(),
            autoplay: state.autoplay,
        }
    }

    #[allow(missing_docs)]
    pub async fn current(&self) -> Option<Track> {
        self.inner.state.lock().await.queue.current().cloned()
    }

    #[allow(missing_docs)]
    pub async fn is_playing(&self) -> bool {
        self.inner.state.lock().await.playing
    }

    #[allow(missing_docs)]
    pub async fn is_paused(&self) -> bool {
        self.inner.state.lock().await.paused
    }

    /// Votes currently registered for `action`.
    pub async fn votes(&self, action: VoteAction) -> usize {
        self.inner.state.lock().await.votes.count(action)
    }

    // ############### Host queries ###############

    async fn members(&self) -> Result<Vec<Member>> {
        self.inner
            .host
            .gateway
            .members(self.inner.guild, self.inner.channel)
            .await
    }

    fn listeners(members: &[Member]) -> usize {
        members.iter().filter(|member| !member.bot).count()
    }

    /// Votes a gated action needs to run.
    pub async fn required(&self, leave: bool) -> Result<usize> {
        if self.lock().await?.vote_disabled {
            return Ok(0);
        }

        let members = self.members().await?;
        Ok(vote::required(Self::listeners(&members), leave))
    }

    /// Whether `member` is in the player's voice channel.
    pub async fn is_user_join(&self, member: &Member) -> Result<bool> {
        let members = self.members().await?;
        Ok(members.iter().any(|joined| joined.id == member.id))
    }

    /// Whether `member` skips voting.
    pub async fn is_privileged(&self, member: &Member) -> Result<bool> {
        if self.lock().await?.vote_disabled {
            return Ok(true);
        }

        let members = self.members().await?;
        Ok((self.inner.host.privilege)(member, &members))
    }

    async fn privileged(&self, state: &PlaybackState, member: &Member) -> Result<bool> {
        if state.vote_disabled {
            return Ok(true);
        }

        let members = self.members().await?;
        Ok((self.inner.host.privilege)(member, &members))
    }

    async fn ensure_privileged(&self, state: &PlaybackState, member: &Member) -> Result<()> {
        if self.privileged(state, member).await? {
            Ok(())
        } else {
            Err(VoicelinkError::MissingPermission)
        }
    }

    /// Registers the vote of `actor`, unless it may skip voting.
    async fn authorize(
        &self,
        state: &mut PlaybackState,
        action: VoteAction,
        actor: &Member,
        bypass: bool,
    ) -> Result<VoteOutcome> {
        if bypass || state.vote_disabled {
            return Ok(VoteOutcome::Executed);
        }

        let members = self.members().await?;
        if (self.inner.host.privilege)(actor, &members) {
            state.votes.clear_action(action);
            return Ok(VoteOutcome::Executed);
        }

        let required = vote::required(Self::listeners(&members), action == VoteAction::Stop);
        Ok(state.votes.cast(action, actor.id, required))
    }

    // ############### Tracks ###############

    /// Resolves `query` on the bound node.
    pub async fn get_tracks(&self, query: &str, requester: UserId) -> Result<SearchResult> {
        self.inner.node.search(query, requester).await
    }

    /// Queues `tracks`, returning the position the first one plays at.
    ///
    /// Nothing starts playing on its own, see [`Player::do_next`].
    pub async fn add_track(&self, tracks: Vec<Track>, at_front: bool) -> Result<usize> {
        self.lock().await?.queue.add_many(tracks, at_front)
    }

    /// Removes one position or a range, optionally only the tracks of `member`.
    pub async fn remove_tracks(
        &self,
        pos1: usize,
        pos2: Option<usize>,
        member: Option<UserId>,
    ) -> Result<Vec<Track>> {
        self.lock().await?.queue.remove(pos1, pos2, member)
    }

    #[allow(missing_docs)]
    pub async fn swap(&self, pos1: usize, pos2: usize) -> Result<(Track, Track)> {
        self.lock().await?.queue.swap(pos1, pos2)
    }

    #[allow(missing_docs)]
    pub async fn move_track(&self, target: usize, to: usize) -> Result<Track> {
        self.lock().await?.queue.move_track(target, to)
    }

    /// Removes every pending track.
    pub async fn clear(&self) -> Result<()> {
        self.lock().await?.queue.clear();
        Ok(())
    }

    /// Forgets the played tracks. The current one keeps playing.
    pub async fn clear_history(&self) -> Result<()> {
        self.lock().await?.queue.history_clear(true);
        Ok(())
    }

    /// Starts the next track if nothing is playing.
    ///
    /// Calling it while a track plays does nothing.
    pub async fn do_next(&self) -> Result<()> {
        let mut state = self.lock().await?;
        if state.playing {
            debug!("guild {} is already playing", self.inner.guild);
            return Ok(());
        }

        self.advance(&mut state, false).await
    }

    /// Moves to the next track and sends it to the node.
    ///
    /// `forced` drops the current track even when repeating it.
    async fn advance(&self, state: &mut PlaybackState, forced: bool) -> Result<()> {
        if forced {
            state.queue.discard_current();
        }

        state.seq += 1;
        state.stuck = false;
        state.playing = false;
        state.paused = false;
        state.position = 0;
        state.votes.clear();

        let next = match state.queue.next() {
            Some(track) => Some(track),
            None if state.autoplay => self.autoplay(state).await,
            None => None,
        };

        let Some(track) = next else {
            if forced {
                if let Err(e) = self.send(&PlayerUpdate::stop()).await {
                    warn!("guild {} couldn't stop the node player: {e}", self.inner.guild);
                }
            }
            info!("guild {} queue ended", self.inner.guild);
            self.notify(PlayerNotice::QueueEnded { guild: self.inner.guild });
            return Ok(());
        };

        self.send(&PlayerUpdate::play(&track.encoded)).await?;
        state.playing = true;

        debug!("guild {} playing `{}`", self.inner.guild, track.title());
        self.save_history(&track);
        self.notify(PlayerNotice::TrackStarted { guild: self.inner.guild, track });

        Ok(())
    }

    /// Queues a related track of the last played one.
    async fn autoplay(&self, state: &mut PlaybackState) -> Option<Track> {
        let last = state.queue.history().back()?.clone();
        if last.source != Source::Youtube {
            debug!("guild {} autoplay only follows youtube tracks", self.inner.guild);
            return None;
        }

        let id = last.identifier();
        let mix = format!("https://www.youtube.com/watch?v={id}&list=RD{id}");
        let result = match self.inner.node.search(&mix, last.requester).await {
            Ok(result) => result,
            Err(e) => {
                warn!("guild {} autoplay search failed: {e}", self.inner.guild);
                return None;
            }
        };

        let candidate = result.into_tracks().into_iter().find(|track| {
            state
                .queue
                .history()
                .iter()
                .all(|played| played.identifier() != track.identifier())
        })?;

        if let Err(e) = state.queue.add(candidate, false) {
            warn!("guild {} autoplay couldn't queue its track: {e}", self.inner.guild);
            return None;
        }
        state.queue.next()
    }

    fn save_history(&self, track: &Track) {
        let store = self.inner.host.store.clone();
        let limit = self.inner.config.history_limit;
        let requester = track.requester;
        let token = track.encoded.clone();

        spawn_fut(async move {
            if let Err(e) = store.push_history(requester, token, limit).await {
                warn!("couldn't save the history of {requester}: {e}");
            }
        });
    }

    /// Skips the current track once `seq` is still the current advance.
    async fn force_next(&self, seq: u64) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.torn_down || state.seq != seq {
            debug!("guild {} stale skip ignored", self.inner.guild);
            return Ok(());
        }

        self.advance(&mut state, true).await
    }

    fn schedule_skip(&self, seq: u64, grace: Duration) {
        let player = self.clone();

        spawn_fut(async move {
            tokio::time::sleep(grace).await;
            if let Err(e) = player.force_next(seq).await {
                warn!("guild {} couldn't skip a failed track: {e}", player.inner.guild);
            }
        });
    }

    // ############### Gated actions ###############

    /// Pauses or resumes playback.
    pub async fn set_pause(&self, pause: bool, actor: &Member) -> Result<VoteOutcome> {
        let mut state = self.lock().await?;
        if state.paused == pause {
            return Ok(VoteOutcome::Executed);
        }

        let action = if pause { VoteAction::Pause } else { VoteAction::Resume };
        let outcome = self.authorize(&mut state, action, actor, false).await?;
        if !outcome.executed() {
            return Ok(outcome);
        }

        self.send(&PlayerUpdate { paused: Some(pause), ..Default::default() }).await?;
        state.paused = pause;

        Ok(outcome)
    }

    /// Skips the current track, or every pending track before `index`.
    ///
    /// The requester of the current track doesn't need votes. Skipping stops
    /// repeating the current track.
    pub async fn skip(&self, actor: &Member, index: Option<usize>) -> Result<VoteOutcome> {
        let mut state = self.lock().await?;
        if let Some(index) = index {
            if index == 0 || index > state.queue.len() {
                return Err(VoicelinkError::TrackInvalidPosition(index));
            }
        }

        let requester = state.queue.current().map(|track| track.requester == actor.id);
        let outcome = self
            .authorize(&mut state, VoteAction::Skip, actor, requester.unwrap_or(false))
            .await?;
        if !outcome.executed() {
            return Ok(outcome);
        }

        if state.queue.repeat() == LoopMode::Track {
            state.queue.set_repeat(LoopMode::Off);
        }
        if let Some(index) = index {
            state.queue.skipto(index)?;
        }
        self.advance(&mut state, false).await?;

        Ok(outcome)
    }

    /// Plays again the `index`-th last history track (1 is the previous one).
    pub async fn back(&self, actor: &Member, index: usize) -> Result<VoteOutcome> {
        let mut state = self.lock().await?;
        if index == 0 || index > state.queue.history().len() {
            return Err(VoicelinkError::TrackInvalidPosition(index));
        }

        let outcome = self.authorize(&mut state, VoteAction::Back, actor, false).await?;
        if !outcome.executed() {
            return Ok(outcome);
        }

        state.queue.backto(index)?;
        self.advance(&mut state, false).await?;

        Ok(outcome)
    }

    /// Shuffles the pending tracks or the history.
    pub async fn shuffle(&self, target: ShuffleTarget, actor: &Member) -> Result<VoteOutcome> {
        let mut state = self.lock().await?;

        let outcome = self.authorize(&mut state, VoteAction::Shuffle, actor, false).await?;
        if outcome.executed() {
            match target {
                ShuffleTarget::Queue => state.queue.shuffle(),
                ShuffleTarget::History => state.queue.shuffle_history(),
            }
        }

        Ok(outcome)
    }

    /// Stops playback and leaves the channel.
    pub async fn leave(&self, actor: &Member) -> Result<VoteOutcome> {
        let outcome = {
            let mut state = self.lock().await?;
            self.authorize(&mut state, VoteAction::Stop, actor, false).await?
        };

        if outcome.executed() {
            self.teardown().await;
        }
        Ok(outcome)
    }

    // ############### Privileged actions ###############

    /// Moves the current track to `position`.
    pub async fn seek(&self, position: Milli, actor: &Member) -> Result<()> {
        let mut state = self.lock().await?;
        self.ensure_privileged(&state, actor).await?;

        let Some(length) = state.queue.current().map(Track::length) else {
            return Ok(());
        };
        if position > length {
            return Err(VoicelinkError::MalformedTime(format!("{position}ms is past the track end")));
        }

        self.send(&PlayerUpdate { position: Some(position), ..Default::default() }).await?;
        state.position = position;

        Ok(())
    }

    /// Restarts the current track.
    pub async fn replay(&self, actor: &Member) -> Result<()> {
        self.seek(0, actor).await
    }

    #[allow(missing_docs)]
    pub async fn set_volume(&self, volume: Volume, actor: &Member) -> Result<()> {
        if volume > MAX_VOLUME {
            return Err(VoicelinkError::VolumeOutOfRange(volume));
        }

        let mut state = self.lock().await?;
        self.ensure_privileged(&state, actor).await?;

        self.send(&PlayerUpdate { volume: Some(volume), ..Default::default() }).await?;
        state.volume = volume;

        Ok(())
    }

    // ############### Settings ###############

    #[allow(missing_docs)]
    pub async fn set_repeat(&self, mode: LoopMode) -> Result<()> {
        self.lock().await?.queue.set_repeat(mode);
        Ok(())
    }

    #[allow(missing_docs)]
    pub async fn set_autoplay(&self, autoplay: bool) -> Result<()> {
        self.lock().await?.autoplay = autoplay;
        Ok(())
    }

    #[allow(missing_docs)]
    pub async fn set_allow_duplicate(&self, allow: bool) -> Result<()> {
        self.lock().await?.queue.set_allow_duplicate(allow);
        Ok(())
    }

    #[allow(missing_docs)]
    pub async fn set_fair(&self, fair: bool) -> Result<()> {
        self.lock().await?.queue.set_fair(fair);
        Ok(())
    }

    // ############### Filters ###############

    async fn apply_filters(&self, state: &mut PlaybackState, previous: Filters) -> Result<()> {
        let update = PlayerUpdate {
            filters: Some(state.filters.payload()),
            ..Default::default()
        };

        if let Err(e) = self.send(&update).await {
            state.filters = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Adds `filter` under `tag`.
    pub async fn add_filter(&self, tag: &str, filter: Filter) -> Result<()> {
        let mut state = self.lock().await?;
        let previous = state.filters.clone();

        state.filters.add(tag, filter)?;
        self.apply_filters(&mut state, previous).await
    }

    #[allow(missing_docs)]
    pub async fn add_preset(&self, preset: Preset) -> Result<()> {
        self.add_filter(preset.tag(), preset.filter()).await
    }

    /// Removes the filter stored under `tag`.
    pub async fn remove_filter(&self, tag: &str) -> Result<Filter> {
        let mut state = self.lock().await?;
        let previous = state.filters.clone();

        let removed = state.filters.remove(tag)?;
        self.apply_filters(&mut state, previous).await?;

        Ok(removed)
    }

    /// Removes every filter.
    pub async fn reset_filter(&self) -> Result<()> {
        let mut state = self.lock().await?;
        let previous = state.filters.clone();

        state.filters.reset();
        self.apply_filters(&mut state, previous).await
    }

    // ############### Lifecycle ###############

    /// Stops the current track and goes idle. The queue is kept.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.lock().await?;

        self.send(&PlayerUpdate::stop()).await?;
        state.queue.discard_current();
        state.seq += 1;
        state.playing = false;
        state.paused = false;
        state.stuck = false;
        state.position = 0;

        Ok(())
    }

    /// Unbinds the player from its node and leaves the voice channel.
    ///
    /// Calling it again does nothing.
    pub async fn teardown(&self) {
        let guild = self.inner.guild;
        let mut state = self.inner.state.lock().await;
        if state.torn_down {
            return;
        }

        state.torn_down = true;
        state.playing = false;
        state.seq += 1;
        state.queue.clear();
        state.queue.history_clear(false);
        state.votes.clear();
        state.filters.reset();

        self.inner.node.unroute(guild).await;
        if let Err(e) = self.inner.node.destroy_player(guild).await {
            warn!("guild {guild} couldn't destroy the node player: {e}");
        }
        if let Err(e) = self.inner.host.gateway.leave(guild).await {
            warn!("guild {guild} couldn't leave the voice channel: {e}");
        }
        if let Some(pool) = self.inner.pool.upgrade() {
            pool.remove_player(self).await;
        }

        info!("player for guild {guild} torn down");
        self.notify(PlayerNotice::Destroyed { guild });
    }

    /// Marks the player torn down without touching the voice session.
    pub(crate) async fn abandon(&self) {
        self.inner.state.lock().await.torn_down = true;
        self.inner.node.unroute(self.inner.guild).await;
    }

    // ############### Node events ###############

    async fn handle_event(&self, event: PlayerEvent) {
        let guild = self.inner.guild;
        let mut state = self.inner.state.lock().await;
        if state.torn_down {
            return;
        }

        match event {
            PlayerEvent::State(update) => state.position = update.position,
            PlayerEvent::TrackStart { .. } => debug!("guild {guild} track started on node"),
            PlayerEvent::TrackEnd { encoded, reason } => {
                if reason == TrackEndReason::Replaced || !state.is_current(&encoded) {
                    debug!("guild {guild} ignored the end of a previous track ({reason:?})");
                    return;
                }
                if !reason.may_start_next() {
                    state.playing = false;
                    return;
                }

                let forced = state.stuck;
                if let Err(e) = self.advance(&mut state, forced).await {
                    warn!("guild {guild} couldn't start the next track: {e}");
                }
            }
            PlayerEvent::TrackStuck { encoded, threshold } => {
                if !state.is_current(&encoded) || state.stuck {
                    return;
                }

                warn!("guild {guild} track stuck for {threshold}ms");
                self.inner.node.register_failure(FailureKind::Stuck).await;
                state.stuck = true;
                self.notify(PlayerNotice::TrackStuck {
                    guild,
                    track: state.queue.current().cloned(),
                    threshold,
                });
                self.schedule_skip(state.seq, self.inner.config.stuck_grace);
            }
            PlayerEvent::TrackException { encoded, exception } => {
                if !state.is_current(&encoded) || state.stuck {
                    return;
                }

                warn!("guild {guild} track exception: {exception}");
                self.inner.node.register_failure(FailureKind::Exception).await;
                state.stuck = true;
                self.notify(PlayerNotice::TrackException {
                    guild,
                    track: state.queue.current().cloned(),
                    message: exception.to_string(),
                });
                self.schedule_skip(state.seq, self.inner.config.exception_grace);
            }
            PlayerEvent::VoiceClosed(closed) => {
                warn!(
                    "guild {guild} voice connection closed with {} ({}), by remote: {}",
                    closed.code, closed.reason, closed.remote
                );
            }
        }
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("guild", &self.inner.guild)
            .field("channel", &self.inner.channel)
            .field("node", &self.inner.node.name())
            .finish()
    }
}

/// Consumes node events in order until the player is unbound.
fn listen(player: Weak<PlayerRef>, mut events: mpsc::UnboundedReceiver<PlayerEvent>) {
    spawn_fut(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = player.upgrade() else {
                break;
            };
            Player { inner }.handle_event(event).await;
        }
    });
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::host::MemoryStore;
    use crate::model::{TrackException, TrackExceptionSeverity};
    use crate::node::mock::{ready_node, track_data, MockTransport};
    use crate::node::NodeOptions;
    use crate::penalty::LoadWeights;
    use crate::pool::NodePool;

    const GUILD: GuildId = 10;
    const CHANNEL: ChannelId = 20;

    struct MockGateway {
        members: Vec<Member>,
        left: AtomicUsize,
    }

    #[async_trait]
    impl VoiceGateway for MockGateway {
        async fn join(&self, _: GuildId, _: ChannelId) -> Result<VoiceState> {
            Ok(VoiceState {
                token: "token".to_string(),
                endpoint: "endpoint".to_string(),
                session_id: "voice".to_string(),
            })
        }

        async fn leave(&self, _: GuildId) -> Result<()> {
            self.left.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn members(&self, _: GuildId, _: ChannelId) -> Result<Vec<Member>> {
            Ok(self.members.clone())
        }
    }

    struct Fixture {
        pool: NodePool,
        node: Node,
        player: Player,
        gateway: Arc<MockGateway>,
        store: Arc<MemoryStore>,
        updates: Arc<StdMutex<Vec<(GuildId, PlayerUpdate)>>>,
        destroyed: Arc<StdMutex<Vec<GuildId>>>,
    }

    impl Fixture {
        fn plays(&self) -> Vec<String> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(_, update)| update.track.as_ref()?.encoded.clone())
                .collect()
        }
    }

    fn listeners(ids: &[UserId]) -> Vec<Member> {
        let mut members: Vec<Member> = ids.iter().map(|id| Member::listener(*id)).collect();
        members.push(Member { id: 99, bot: true, moderator: false });
        members
    }

    fn track(id: &str, requester: UserId) -> Track {
        Track::from_data(track_data(id), requester)
    }

    async fn setup_with(
        transport: MockTransport,
        members: Vec<Member>,
        settings: GuildSettings,
        config: PlayerConfig,
    ) -> Fixture {
        let updates = transport.updates.clone();
        let destroyed = transport.destroyed.clone();
        let node = ready_node("main", transport).await;

        let pool = NodePool::new(NodeOptions::default(), LoadWeights::default(), 0);
        pool.register_node(node.clone()).await.unwrap();

        let gateway = Arc::new(MockGateway { members, left: AtomicUsize::new(0) });
        let store = Arc::new(MemoryStore::new());
        let host = Host::new(gateway.clone(), store.clone());

        let player = Player::new(GUILD, CHANNEL, node.clone(), host, &settings, config, pool.downgrade())
            .await
            .unwrap();
        pool.insert_player(player.clone()).await.unwrap();

        Fixture { pool, node, player, gateway, store, updates, destroyed }
    }

    async fn setup(members: Vec<Member>) -> Fixture {
        let settings = GuildSettings { duplicate_track: true, ..Default::default() };
        setup_with(MockTransport::default(), members, settings, PlayerConfig::default()).await
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_skip_needs_two_distinct_votes() {
        let fixture = setup(listeners(&[1, 2, 3, 4])).await;
        let player = &fixture.player;
        player.add_track(vec![track("a", 1), track("b", 1)], false).await.unwrap();
        player.do_next().await.unwrap();

        assert_eq!(player.required(false).await.unwrap(), 2);

        let first = player.skip(&Member::listener(2), None).await.unwrap();
        assert_eq!(first, VoteOutcome::Voted { votes: 1, required: 2 });
        let again = player.skip(&Member::listener(2), None).await.unwrap();
        assert_eq!(again, VoteOutcome::AlreadyVoted);
        assert_eq!(player.current().await.unwrap().identifier(), "a");

        let second = player.skip(&Member::listener(3), None).await.unwrap();
        assert_eq!(second, VoteOutcome::Executed);
        assert_eq!(player.current().await.unwrap().identifier(), "b");
        assert_eq!(player.votes(VoteAction::Skip).await, 0);
        assert_eq!(fixture.plays().len(), 2);
    }

    #[tokio::test]
    async fn test_skip_to_position_keeps_queue_cycle() {
        let fixture = setup(listeners(&[1])).await;
        let player = &fixture.player;
        let tracks = ["1", "2", "3", "4", "5"].map(|id| track(id, 1)).to_vec();
        player.add_track(tracks, false).await.unwrap();
        player.set_repeat(LoopMode::Queue).await.unwrap();
        player.do_next().await.unwrap();

        let outcome = player.skip(&Member::listener(1), Some(3)).await.unwrap();

        assert_eq!(outcome, VoteOutcome::Executed);
        let snapshot = player.snapshot().await;
        let order: Vec<_> = snapshot
            .current()
            .into_iter()
            .chain(snapshot.queue.tracks())
            .map(|t| t.identifier())
            .collect();
        assert_eq!(order, ["4", "5", "1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_clear_pending_and_history_apart() {
        let fixture = setup(listeners(&[1])).await;
        let player = &fixture.player;
        let tracks = ["a", "b", "c"].map(|id| track(id, 1)).to_vec();
        player.add_track(tracks, false).await.unwrap();
        player.do_next().await.unwrap();
        player.skip(&Member::listener(1), None).await.unwrap();

        player.clear_history().await.unwrap();
        let snapshot = player.snapshot().await;
        assert!(snapshot.queue.history().is_empty());
        assert_eq!(snapshot.current().unwrap().identifier(), "b");
        assert_eq!(snapshot.queue.len(), 1);

        player.clear().await.unwrap();
        let snapshot = player.snapshot().await;
        assert!(snapshot.queue.is_empty());
        assert_eq!(snapshot.current().unwrap().identifier(), "b");
    }

    #[tokio::test]
    async fn test_privileged_actor_skips_voting() {
        let fixture = setup(listeners(&[1, 2, 3, 4])).await;
        let player = &fixture.player;
        player.add_track(vec![track("a", 1), track("b", 1)], false).await.unwrap();
        player.do_next().await.unwrap();

        let outcome = player.set_pause(true, &Member::moderator(5)).await.unwrap();

        assert_eq!(outcome, VoteOutcome::Executed);
        assert_eq!(player.votes(VoteAction::Pause).await, 0);
        assert!(player.is_paused().await);

        let outcome = player.skip(&Member::listener(1), None).await.unwrap();
        assert_eq!(outcome, VoteOutcome::Executed, "requester of the current track");
        assert_eq!(player.current().await.unwrap().identifier(), "b");
    }

    #[tokio::test]
    async fn test_do_next_is_idempotent() {
        let fixture = setup(listeners(&[1])).await;
        let player = &fixture.player;
        player
            .add_track(vec![track("a", 1), track("b", 1), track("c", 1)], false)
            .await
            .unwrap();

        player.do_next().await.unwrap();
        player.do_next().await.unwrap();

        let snapshot = player.snapshot().await;
        assert_eq!(snapshot.current().unwrap().identifier(), "a");
        assert_eq!(snapshot.queue.len(), 2);
        assert_eq!(fixture.plays().len(), 1);

        settle().await;
        let history = fixture.store.user(1).await.unwrap().history;
        assert_eq!(history, vec![track("a", 1).encoded]);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let fixture = setup(listeners(&[1])).await;
        let player = &fixture.player;
        player.add_track(vec![track("a", 1)], false).await.unwrap();
        player.do_next().await.unwrap();
        assert_eq!(fixture.node.bound_players(), 1);

        player.teardown().await;
        player.teardown().await;

        assert_eq!(fixture.node.bound_players(), 0);
        assert_eq!(fixture.gateway.left.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.destroyed.lock().unwrap().len(), 1);
        assert!(fixture.pool.get_player(GUILD).await.is_none());
        assert!(matches!(player.do_next().await, Err(VoicelinkError::PlayerTornDown)));
    }

    #[tokio::test]
    async fn test_stuck_then_end_advances_once() {
        let config = PlayerConfig { stuck_grace: Duration::from_millis(100), ..Default::default() };
        let settings = GuildSettings { duplicate_track: true, ..Default::default() };
        let fixture = setup_with(MockTransport::default(), listeners(&[1]), settings, config).await;
        let player = &fixture.player;
        let mut notices = player.subscribe();
        player
            .add_track(vec![track("a", 1), track("b", 1), track("c", 1)], false)
            .await
            .unwrap();
        player.do_next().await.unwrap();
        let a = track("a", 1).encoded;

        fixture
            .node
            .dispatch(GUILD, PlayerEvent::TrackStuck { encoded: a.clone(), threshold: 10_000 })
            .await;
        fixture
            .node
            .dispatch(GUILD, PlayerEvent::TrackEnd { encoded: a, reason: TrackEndReason::Finished })
            .await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(player.current().await.unwrap().identifier(), "b");
        assert_eq!(fixture.plays().len(), 2);
        assert!(matches!(notices.recv().await, Ok(PlayerNotice::TrackStarted { .. })));
        assert!(matches!(notices.recv().await, Ok(PlayerNotice::TrackStuck { .. })));
        assert!(matches!(notices.recv().await, Ok(PlayerNotice::TrackStarted { .. })));
    }

    #[tokio::test]
    async fn test_exception_skips_after_grace() {
        let config = PlayerConfig { exception_grace: Duration::from_millis(50), ..Default::default() };
        let settings = GuildSettings { duplicate_track: true, ..Default::default() };
        let fixture = setup_with(MockTransport::default(), listeners(&[1]), settings, config).await;
        let player = &fixture.player;
        player.add_track(vec![track("a", 1), track("b", 1)], false).await.unwrap();
        player.set_repeat(LoopMode::Track).await.unwrap();
        player.do_next().await.unwrap();

        let exception = TrackException {
            message: Some("unavailable".to_string()),
            severity: TrackExceptionSeverity::Common,
            cause: "test".to_string(),
        };
        fixture
            .node
            .dispatch(GUILD, PlayerEvent::TrackException { encoded: track("a", 1).encoded, exception })
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let snapshot = player.snapshot().await;
        assert_eq!(snapshot.current().unwrap().identifier(), "b");
        assert_eq!(snapshot.queue.history().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_and_replaced_ends_are_ignored() {
        let fixture = setup(listeners(&[1])).await;
        let player = &fixture.player;
        player.add_track(vec![track("a", 1), track("b", 1)], false).await.unwrap();
        player.do_next().await.unwrap();

        let a = track("a", 1).encoded;
        fixture
            .node
            .dispatch(GUILD, PlayerEvent::TrackEnd { encoded: a.clone(), reason: TrackEndReason::Replaced })
            .await;
        fixture
            .node
            .dispatch(GUILD, PlayerEvent::TrackEnd { encoded: "other".to_string(), reason: TrackEndReason::Finished })
            .await;
        settle().await;

        assert_eq!(player.current().await.unwrap().encoded, a);
        assert!(player.is_playing().await);
    }

    #[tokio::test]
    async fn test_queue_end_goes_idle() {
        let fixture = setup(listeners(&[1])).await;
        let player = &fixture.player;
        let mut notices = player.subscribe();
        player.add_track(vec![track("a", 1)], false).await.unwrap();
        player.do_next().await.unwrap();

        fixture
            .node
            .dispatch(GUILD, PlayerEvent::TrackEnd { encoded: track("a", 1).encoded, reason: TrackEndReason::Finished })
            .await;
        settle().await;

        assert!(!player.is_playing().await);
        assert!(player.current().await.is_none());
        assert!(matches!(notices.recv().await, Ok(PlayerNotice::TrackStarted { .. })));
        assert!(matches!(notices.recv().await, Ok(PlayerNotice::QueueEnded { guild: GUILD })));
    }

    #[tokio::test]
    async fn test_autoplay_follows_the_mix() {
        let transport = MockTransport::default();
        transport.results.lock().unwrap().insert(
            "https://www.youtube.com/watch?v=a&list=RDa".to_string(),
            vec![track_data("a"), track_data("x"), track_data("y")],
        );
        let settings = GuildSettings { autoplay: true, ..Default::default() };
        let fixture = setup_with(transport, listeners(&[1]), settings, PlayerConfig::default()).await;
        let player = &fixture.player;
        player.add_track(vec![track("a", 1)], false).await.unwrap();
        player.do_next().await.unwrap();

        fixture
            .node
            .dispatch(GUILD, PlayerEvent::TrackEnd { encoded: track("a", 1).encoded, reason: TrackEndReason::Finished })
            .await;
        settle().await;

        let current = player.current().await.unwrap();
        assert_eq!(current.identifier(), "x");
        assert_eq!(current.requester, 1);
    }

    #[tokio::test]
    async fn test_leave_with_two_listeners_needs_both() {
        let fixture = setup(listeners(&[1, 2])).await;
        let player = &fixture.player;

        assert_eq!(player.required(true).await.unwrap(), 2);
        assert!(!player.leave(&Member::listener(1)).await.unwrap().executed());
        assert!(!player.is_torn_down().await);

        assert!(player.leave(&Member::listener(2)).await.unwrap().executed());
        assert!(player.is_torn_down().await);
        assert_eq!(fixture.node.bound_players(), 0);
    }

    #[tokio::test]
    async fn test_privileged_only_actions() {
        let fixture = setup(listeners(&[1, 2])).await;
        let player = &fixture.player;

        assert!(matches!(
            player.set_volume(151, &Member::moderator(1)).await,
            Err(VoicelinkError::VolumeOutOfRange(151))
        ));
        assert!(matches!(
            player.set_volume(50, &Member::listener(1)).await,
            Err(VoicelinkError::MissingPermission)
        ));

        player.set_volume(50, &Member::moderator(1)).await.unwrap();
        assert_eq!(player.snapshot().await.volume, 50);
        assert!(player.is_user_join(&Member::listener(2)).await.unwrap());
        assert!(!player.is_user_join(&Member::listener(3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_filters_are_sent_and_tags_checked() {
        let fixture = setup(listeners(&[1])).await;
        let player = &fixture.player;

        player.add_preset(Preset::Nightcore).await.unwrap();
        assert!(matches!(
            player.add_preset(Preset::Nightcore).await,
            Err(VoicelinkError::FilterTagAlreadyInUse(_))
        ));
        assert!(matches!(
            player.remove_filter("vaporwave").await,
            Err(VoicelinkError::FilterTagInvalid(_))
        ));
        player.reset_filter().await.unwrap();

        let updates = fixture.updates.lock().unwrap();
        let sent: Vec<_> = updates.iter().filter_map(|(_, update)| update.filters.as_ref()).collect();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].timescale.is_some());
        assert_eq!(sent[1], &crate::model::PlayerFilters::default());
    }
}
