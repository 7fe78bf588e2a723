//! Per-player track backlog plus bounded history.
//!
//! Positions in every public method are 1-based and relative to the pending
//! tracks: position 1 is the track that plays next. The current track is not
//! part of the pending sequence.
//!
//! Fair ordering is applied at insertion time. Once a track is placed, reading
//! the queue never reorders it, so `remove`/`swap`/`move_track` positions
//! always match what [`Queue::tracks`] shows.

use std::collections::{HashSet, VecDeque};
use std::fmt::Display;
use std::str::FromStr;

use log::debug;
use rand::seq::SliceRandom;

use crate::error::{Result, VoicelinkError};
use crate::model::{Milli, UserId};
use crate::track::Track;

/// Repeat policy applied when advancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    /// Finished tracks go to history.
    #[default]
    Off,
    /// The current track is played again.
    Track,
    /// Finished tracks are re-appended to the pending tail.
    Queue,
}

impl FromStr for LoopMode {
    type Err = VoicelinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(LoopMode::Off),
            "track" => Ok(LoopMode::Track),
            "queue" => Ok(LoopMode::Queue),
            _ => Err(VoicelinkError::InvalidRepeatMode(s.to_string())),
        }
    }
}

impl Display for LoopMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LoopMode::Off => "off",
            LoopMode::Track => "track",
            LoopMode::Queue => "queue",
        })
    }
}

/// Which sequence a shuffle applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub enum ShuffleTarget {
    #[default]
    Queue,
    History,
}

/// Queue limits and policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Max amount of pending tracks.
    pub max_size: usize,
    /// Max amount of tracks kept in history.
    pub history_size: usize,
    /// Whether the same track may be queued twice.
    pub allow_duplicate: bool,
    /// Interleave insertions by requester.
    pub fair: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            history_size: 50,
            allow_duplicate: true,
            fair: false,
        }
    }
}

/// Ordered pending tracks, the current track and recently played ones.
#[derive(Debug, Clone)]
pub struct Queue {
    current: Option<Track>,
    pending: VecDeque<Track>,
    history: VecDeque<Track>,
    repeat: LoopMode,
    config: QueueConfig,
}

impl Queue {
    /// Creates an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            current: None,
            pending: VecDeque::new(),
            history: VecDeque::new(),
            repeat: LoopMode::Off,
            config,
        }
    }

    /// Track at the front, if any.
    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    /// Pending tracks in play order.
    pub fn tracks(&self) -> &VecDeque<Track> {
        &self.pending
    }

    /// Played tracks, most recent last.
    pub fn history(&self) -> &VecDeque<Track> {
        &self.history
    }

    /// Amount of pending tracks.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if there isn't any pending track.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending tracks plus the current one.
    pub fn count(&self) -> usize {
        self.pending.len() + self.current.is_some() as usize
    }

    #[allow(missing_docs)]
    pub fn repeat(&self) -> LoopMode {
        self.repeat
    }

    #[allow(missing_docs)]
    pub fn set_repeat(&mut self, mode: LoopMode) {
        self.repeat = mode;
    }

    #[allow(missing_docs)]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Toggles duplicate suppression.
    pub fn set_allow_duplicate(&mut self, allow: bool) {
        self.config.allow_duplicate = allow;
    }

    /// Toggles fair insertion. Already queued tracks keep their order.
    pub fn set_fair(&mut self, fair: bool) {
        self.config.fair = fair;
    }

    /// Sum of known lengths (streams excluded) of the pending and current tracks.
    pub fn total_duration(&self) -> Milli {
        self.current
            .iter()
            .chain(self.pending.iter())
            .filter(|track| !track.is_stream())
            .map(Track::length)
            .sum()
    }

    /// Position of the first pending track with the given identifier.
    pub fn find_position(&self, identifier: &str) -> Option<usize> {
        self.pending
            .iter()
            .position(|track| track.identifier() == identifier)
            .map(|index| index + 1)
    }

    fn contains(&self, identifier: &str) -> bool {
        self.current.iter().any(|track| track.identifier() == identifier)
            || self.pending.iter().any(|track| track.identifier() == identifier)
    }

    /// Queues one track and returns the position where it will play.
    ///
    /// `at_front` places it right after the current track.
    pub fn add(&mut self, track: Track, at_front: bool) -> Result<usize> {
        if !self.config.allow_duplicate && self.contains(track.identifier()) {
            return Err(VoicelinkError::DuplicateTrack(track.title().to_string()));
        }
        if self.pending.len() >= self.config.max_size {
            return Err(VoicelinkError::QueueFull(self.config.max_size));
        }

        Ok(self.insert(track, at_front, 0))
    }

    /// Queues several tracks and returns the position of the first one.
    ///
    /// With duplicate suppression enabled, tracks already queued (or repeated
    /// inside `tracks`) are skipped; if nothing is left the call fails with
    /// [`VoicelinkError::DuplicateTrack`]. Capacity is checked for the whole
    /// batch before anything is inserted.
    pub fn add_many(&mut self, tracks: Vec<Track>, at_front: bool) -> Result<usize> {
        let tracks = if self.config.allow_duplicate {
            tracks
        } else {
            let mut seen = HashSet::new();
            let first_title = tracks.first().map(|track| track.title().to_string());
            let kept: Vec<_> = tracks
                .into_iter()
                .filter(|track| !self.contains(track.identifier()))
                .filter(|track| seen.insert(track.identifier().to_string()))
                .collect();

            if kept.is_empty() {
                return Err(VoicelinkError::DuplicateTrack(first_title.unwrap_or_default()));
            }
            kept
        };

        if tracks.is_empty() {
            return Ok(self.pending.len());
        }
        if self.pending.len() + tracks.len() > self.config.max_size {
            return Err(VoicelinkError::QueueFull(self.config.max_size));
        }

        let mut first = None;
        for (offset, track) in tracks.into_iter().enumerate() {
            let position = self.insert(track, at_front, offset);
            first.get_or_insert(position);
        }

        Ok(first.unwrap_or(1))
    }

    /// Unchecked insertion. `offset` keeps a batch in order when `at_front`.
    fn insert(&mut self, track: Track, at_front: bool, offset: usize) -> usize {
        let index = if at_front {
            offset.min(self.pending.len())
        } else if self.config.fair {
            self.fair_index(track.requester)
        } else {
            self.pending.len()
        };

        debug!("queued `{}` at position {}", track.title(), index + 1);
        self.pending.insert(index, track);

        index + 1
    }

    /// Index right after the requester's last track, pushed past one full
    /// round of other requesters.
    fn fair_index(&self, requester: UserId) -> usize {
        let start = self
            .pending
            .iter()
            .rposition(|track| track.requester == requester)
            .map_or(0, |index| index + 1);

        let mut round = HashSet::new();
        let mut index = start;
        for track in self.pending.iter().skip(start) {
            if !round.insert(track.requester) {
                break;
            }
            index += 1;
        }

        index
    }

    fn check_position(&self, position: usize, len: usize) -> Result<()> {
        if position == 0 || position > len {
            return Err(VoicelinkError::TrackInvalidPosition(position));
        }
        Ok(())
    }

    /// Removes one position or the inclusive range `pos1..=pos2`.
    ///
    /// With `member`, only tracks requested by them inside the range are
    /// removed. Out of range positions fail without removing anything.
    pub fn remove(
        &mut self,
        pos1: usize,
        pos2: Option<usize>,
        member: Option<UserId>,
    ) -> Result<Vec<Track>> {
        let pos2 = pos2.unwrap_or(pos1);
        self.check_position(pos1, self.pending.len())?;
        self.check_position(pos2, self.pending.len())?;

        let (from, to) = if pos1 <= pos2 { (pos1, pos2) } else { (pos2, pos1) };

        let mut removed = Vec::new();
        let mut index = from - 1;
        for _ in from..=to {
            let matches = member.map_or(true, |member| self.pending[index].requester == member);
            if matches {
                if let Some(track) = self.pending.remove(index) {
                    removed.push(track);
                }
            } else {
                index += 1;
            }
        }

        debug!("removed {} tracks between {from} and {to}", removed.len());
        Ok(removed)
    }

    /// Removes every pending track requested by `member`.
    pub fn remove_requester(&mut self, member: UserId) -> Vec<Track> {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|track| track.requester == member);
        self.pending = kept.into();

        removed
    }

    /// Swaps two positions, returning the tracks that were at `pos1` and `pos2`.
    pub fn swap(&mut self, pos1: usize, pos2: usize) -> Result<(Track, Track)> {
        self.check_position(pos1, self.pending.len())?;
        self.check_position(pos2, self.pending.len())?;

        self.pending.swap(pos1 - 1, pos2 - 1);

        Ok((self.pending[pos2 - 1].clone(), self.pending[pos1 - 1].clone()))
    }

    /// Moves the track at `target` so it plays at position `to`.
    pub fn move_track(&mut self, target: usize, to: usize) -> Result<Track> {
        self.check_position(target, self.pending.len())?;
        self.check_position(to, self.pending.len())?;

        let track = self
            .pending
            .remove(target - 1)
            .ok_or(VoicelinkError::TrackInvalidPosition(target))?;
        self.pending.insert(to - 1, track.clone());

        Ok(track)
    }

    /// Drops the tracks before `position`, so it becomes the next one.
    ///
    /// Skipped tracks go to history. When repeating the queue they're also
    /// requeued at the tail, after the current track.
    pub fn skipto(&mut self, position: usize) -> Result<()> {
        self.check_position(position, self.pending.len())?;

        let cycle = self.repeat == LoopMode::Queue;
        if cycle {
            if let Some(current) = self.current.take() {
                self.pending.push_back(current.clone());
                self.push_history(current);
            }
        }

        for _ in 1..position {
            if let Some(track) = self.pending.pop_front() {
                if cycle {
                    self.pending.push_back(track.clone());
                }
                self.push_history(track);
            }
        }

        Ok(())
    }

    /// Restores the last `position` history tracks in front of the pending
    /// ones. The current track, if any, is requeued right after them.
    pub fn backto(&mut self, position: usize) -> Result<()> {
        self.check_position(position, self.history.len())?;

        if let Some(current) = self.current.take() {
            self.pending.push_front(current);
        }
        for _ in 0..position {
            if let Some(track) = self.history.pop_back() {
                self.pending.push_front(track);
            }
        }

        Ok(())
    }

    /// Removes every pending track.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Clears history. The current track is dropped too unless `keep_current`.
    pub fn history_clear(&mut self, keep_current: bool) {
        self.history.clear();
        if !keep_current {
            self.current = None;
        }
    }

    /// Randomizes the pending tracks.
    pub fn shuffle(&mut self) {
        self.pending.make_contiguous().shuffle(&mut rand::thread_rng());
    }

    /// Randomizes the history.
    pub fn shuffle_history(&mut self) {
        self.history.make_contiguous().shuffle(&mut rand::thread_rng());
    }

    /// Advances according to the repeat mode and returns the new current track.
    pub fn next(&mut self) -> Option<Track> {
        if self.repeat == LoopMode::Track {
            if let Some(current) = self.current.as_ref() {
                return Some(current.clone());
            }
        }

        if let Some(finished) = self.current.take() {
            if self.repeat == LoopMode::Queue {
                self.pending.push_back(finished.clone());
            }
            self.push_history(finished);
        }

        self.current = self.pending.pop_front();
        self.current.clone()
    }

    /// Moves the current track to history regardless of the repeat mode.
    pub fn discard_current(&mut self) {
        if let Some(track) = self.current.take() {
            self.push_history(track);
        }
    }

    fn push_history(&mut self, track: Track) {
        self.history.push_back(track);
        while self.history.len() > self.config.history_size {
            self.history.pop_front();
        }
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::TrackInfo;

    fn track(id: &str, requester: UserId) -> Track {
        Track::from_info(
            TrackInfo {
                identifier: id.to_string(),
                is_seekable: true,
                author: "author".to_string(),
                length: 60_000,
                is_stream: false,
                position: 0,
                title: format!("title {id}"),
                uri: None,
                artwork_url: None,
                isrc: None,
                source_name: "youtube".to_string(),
            },
            requester,
        )
    }

    fn ids(queue: &Queue) -> Vec<String> {
        queue.tracks().iter().map(|t| t.identifier().to_string()).collect()
    }

    fn filled(n: usize) -> Queue {
        let mut queue = Queue::default();
        for i in 1..=n {
            queue.add(track(&i.to_string(), 1), false).unwrap();
        }
        queue
    }

    #[test]
    fn test_add_returns_play_position() {
        let mut queue = Queue::default();

        assert_eq!(queue.add(track("a", 1), false).unwrap(), 1);
        assert_eq!(queue.add(track("b", 1), false).unwrap(), 2);
        assert_eq!(queue.add(track("c", 1), true).unwrap(), 1);
        assert_eq!(ids(&queue), ["c", "a", "b"]);
    }

    #[test]
    fn test_add_many_at_front_keeps_batch_order() {
        let mut queue = filled(2);

        let position = queue.add_many(vec![track("x", 2), track("y", 2)], true).unwrap();

        assert_eq!(position, 1);
        assert_eq!(ids(&queue), ["x", "y", "1", "2"]);
    }

    #[test]
    fn test_remove_ranges() {
        for from in 1..=5 {
            for to in from..=5 {
                let mut queue = filled(5);
                let removed = queue.remove(from, Some(to), None).unwrap();

                let expected_removed: Vec<String> = (from..=to).map(|i| i.to_string()).collect();
                let expected_kept: Vec<String> = (1..=5)
                    .filter(|i| *i < from || *i > to)
                    .map(|i| i.to_string())
                    .collect();

                let removed: Vec<String> = removed.iter().map(|t| t.identifier().to_string()).collect();
                assert_eq!(removed, expected_removed);
                assert_eq!(ids(&queue), expected_kept);
            }
        }
    }

    #[test]
    fn test_remove_out_of_range_keeps_queue() {
        let mut queue = filled(3);

        for (pos1, pos2) in [(0, None), (4, None), (1, Some(4)), (0, Some(2))] {
            let result = queue.remove(pos1, pos2, None);
            assert!(matches!(result, Err(VoicelinkError::TrackInvalidPosition(_))));
        }
        assert_eq!(ids(&queue), ["1", "2", "3"]);
    }

    #[test]
    fn test_remove_by_member_in_range() {
        let mut queue = Queue::default();
        for (id, requester) in [("a", 1), ("b", 2), ("c", 1), ("d", 2)] {
            queue.add(track(id, requester), false).unwrap();
        }

        let removed = queue.remove(1, Some(3), Some(1)).unwrap();

        assert_eq!(removed.len(), 2);
        assert_eq!(ids(&queue), ["b", "d"]);
        assert_eq!(queue.remove_requester(2).len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_swap_and_move() {
        let mut queue = filled(4);

        let (first, second) = queue.swap(1, 3).unwrap();
        assert_eq!((first.identifier(), second.identifier()), ("1", "3"));
        assert_eq!(ids(&queue), ["3", "2", "1", "4"]);

        let moved = queue.move_track(4, 1).unwrap();
        assert_eq!(moved.identifier(), "4");
        assert_eq!(ids(&queue), ["4", "3", "2", "1"]);

        assert!(queue.swap(1, 5).is_err());
        assert!(queue.move_track(0, 1).is_err());
        assert_eq!(ids(&queue), ["4", "3", "2", "1"]);
    }

    #[test]
    fn test_repeat_track_keeps_identity_and_history() {
        let mut queue = filled(3);
        queue.next();
        queue.set_repeat(LoopMode::Track);
        let history_len = queue.history().len();

        for _ in 0..10 {
            assert_eq!(queue.next().unwrap().identifier(), "1");
        }

        assert_eq!(queue.history().len(), history_len);
        assert_eq!(ids(&queue), ["2", "3"]);
    }

    #[test]
    fn test_repeat_queue_cycles_back_to_original_order() {
        let mut queue = filled(4);
        queue.next();
        queue.set_repeat(LoopMode::Queue);
        let original = ids(&queue);

        for _ in 0..4 {
            queue.next();
        }

        assert_eq!(ids(&queue), original);
        assert_eq!(queue.current().unwrap().identifier(), "1");
    }

    #[test]
    fn test_repeat_off_consumes_into_bounded_history() {
        let mut queue = Queue::new(QueueConfig { history_size: 2, ..Default::default() });
        for i in 1..=4 {
            queue.add(track(&i.to_string(), 1), false).unwrap();
        }

        while queue.next().is_some() {}

        let history: Vec<_> = queue.history().iter().map(|t| t.identifier()).collect();
        assert_eq!(history, ["3", "4"]);
        assert!(queue.current().is_none());
    }

    #[test]
    fn test_duplicate_suppression() {
        let mut queue = Queue::new(QueueConfig { allow_duplicate: false, ..Default::default() });
        queue.add(track("a", 1), false).unwrap();

        let result = queue.add(track("a", 2), false);
        assert!(matches!(result, Err(VoicelinkError::DuplicateTrack(_))));
        assert_eq!(queue.len(), 1);

        queue.set_allow_duplicate(true);
        queue.add(track("a", 2), false).unwrap();
        assert_eq!(ids(&queue), ["a", "a"]);

        let removed = queue.remove(2, None, None).unwrap();
        assert_eq!(removed[0].requester, 2);
        let removed = queue.remove(1, None, None).unwrap();
        assert_eq!(removed[0].requester, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_suppression_filters_batches() {
        let mut queue = Queue::new(QueueConfig { allow_duplicate: false, ..Default::default() });
        queue.add(track("a", 1), false).unwrap();

        let position = queue
            .add_many(vec![track("a", 1), track("b", 1), track("b", 1)], false)
            .unwrap();

        assert_eq!(position, 2);
        assert_eq!(ids(&queue), ["a", "b"]);
        assert!(matches!(
            queue.add_many(vec![track("a", 1)], false),
            Err(VoicelinkError::DuplicateTrack(_))
        ));
    }

    #[test]
    fn test_queue_full_leaves_queue_unchanged() {
        let mut queue = Queue::new(QueueConfig { max_size: 2, ..Default::default() });
        queue.add(track("a", 1), false).unwrap();

        let result = queue.add_many(vec![track("b", 1), track("c", 1)], false);

        assert!(matches!(result, Err(VoicelinkError::QueueFull(2))));
        assert_eq!(ids(&queue), ["a"]);
    }

    #[test]
    fn test_fair_queue_interleaves_requesters() {
        let mut queue = Queue::new(QueueConfig { fair: true, ..Default::default() });
        for id in ["a1", "a2", "a3"] {
            queue.add(track(id, 1), false).unwrap();
        }

        assert_eq!(queue.add(track("b1", 2), false).unwrap(), 2);
        queue.add(track("b2", 2), false).unwrap();
        queue.add(track("c1", 3), false).unwrap();

        assert_eq!(ids(&queue), ["a1", "b1", "c1", "a2", "b2", "a3"]);
    }

    #[test]
    fn test_skipto_and_backto() {
        let mut queue = filled(5);
        queue.next();

        queue.skipto(3).unwrap();
        assert_eq!(ids(&queue), ["4", "5"]);
        let history: Vec<_> = queue.history().iter().map(|t| t.identifier()).collect();
        assert_eq!(history, ["2", "3"]);

        queue.backto(2).unwrap();
        assert!(queue.current().is_none());
        assert_eq!(ids(&queue), ["2", "3", "1", "4", "5"]);
        assert!(queue.history().is_empty());

        assert!(matches!(queue.skipto(6), Err(VoicelinkError::TrackInvalidPosition(6))));
        assert!(matches!(queue.backto(1), Err(VoicelinkError::TrackInvalidPosition(1))));
    }

    #[test]
    fn test_skipto_with_queue_repeat_keeps_cycle() {
        let mut queue = filled(4);
        queue.set_repeat(LoopMode::Queue);

        queue.skipto(3).unwrap();

        assert_eq!(ids(&queue), ["3", "4", "1", "2"]);
    }

    #[test]
    fn test_skipto_with_queue_repeat_requeues_current_first() {
        let mut queue = filled(5);
        queue.set_repeat(LoopMode::Queue);
        queue.next();

        queue.skipto(3).unwrap();
        assert!(queue.current().is_none());
        assert_eq!(ids(&queue), ["4", "5", "1", "2", "3"]);

        assert_eq!(queue.next().unwrap().identifier(), "4");
        let history: Vec<_> = queue.history().iter().map(|t| t.identifier()).collect();
        assert_eq!(history, ["1", "2", "3"]);
    }

    #[test]
    fn test_loop_mode_parsing() {
        assert_eq!("Queue".parse::<LoopMode>().unwrap(), LoopMode::Queue);
        assert!(matches!("forever".parse::<LoopMode>(), Err(VoicelinkError::InvalidRepeatMode(_))));
    }

    #[test]
    fn test_total_duration_skips_streams() {
        let mut queue = filled(2);
        let mut live = track("live", 1);
        live.info.is_stream = true;
        queue.add(live, false).unwrap();

        assert_eq!(queue.total_duration(), 120_000);
    }
}
