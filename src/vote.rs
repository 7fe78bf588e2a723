//! Vote bookkeeping for actions non privileged listeners can't run alone.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::model::UserId;

/// Actions gated behind votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum VoteAction {
    Pause,
    Resume,
    Skip,
    Back,
    Shuffle,
    /// Stops playback and leaves the channel.
    Stop,
}

/// Result of asking to run a gated action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// The action ran.
    Executed,
    /// The vote was registered but more are needed.
    Voted {
        #[allow(missing_docs)]
        votes: usize,
        #[allow(missing_docs)]
        required: usize,
    },
    /// The actor already voted for this action in the current round.
    AlreadyVoted,
}

impl VoteOutcome {
    #[allow(missing_docs)]
    pub fn executed(&self) -> bool {
        matches!(self, VoteOutcome::Executed)
    }
}

/// Votes needed among `listeners` non bot members.
///
/// Leaving with two listeners needs both of them.
pub fn required(listeners: usize, leave: bool) -> usize {
    if leave && listeners == 2 {
        return 2;
    }

    // ceil(listeners / 2.5)
    (listeners * 2 + 4) / 5
}

/// One vote set per action.
#[derive(Debug, Clone, Default)]
pub struct Votes {
    sets: HashMap<VoteAction, HashSet<UserId>>,
}

impl Votes {
    /// Registers the vote of `user` and tells if `action` may run.
    ///
    /// The set of `action` is cleared once it reaches `required`.
    pub fn cast(&mut self, action: VoteAction, user: UserId, required: usize) -> VoteOutcome {
        let set = self.sets.entry(action).or_default();

        if !set.insert(user) {
            return VoteOutcome::AlreadyVoted;
        }

        let votes = set.len();
        debug!("{action:?} vote from {user}: {votes}/{required}");

        if votes >= required {
            set.clear();
            return VoteOutcome::Executed;
        }

        VoteOutcome::Voted { votes, required }
    }

    /// Amount of votes registered for `action`.
    pub fn count(&self, action: VoteAction) -> usize {
        self.sets.get(&action).map_or(0, HashSet::len)
    }

    #[allow(missing_docs)]
    pub fn clear_action(&mut self, action: VoteAction) {
        self.sets.remove(&action);
    }

    /// Clears every set. Called on each track advance.
    pub fn clear(&mut self) {
        self.sets.clear();
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.sets.values().all(HashSet::is_empty)
    }
}
