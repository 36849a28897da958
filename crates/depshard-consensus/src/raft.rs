//! A minimal single-leader replicated log: leader election with
//! randomized timeouts, log replication, and majority commit. This is the
//! engine a `ShardReplica` drives one tick at a time; it owns no tasks and
//! does no I/O itself — `tick`/`handle_message` return the messages the
//! caller must hand to the transport.

use std::collections::{HashMap, HashSet};

use rand::Rng;
use serde::{Deserialize, Serialize};

use depshard_core::{CommitIndex, ReplicaId, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Stopped,
}

/// One log slot: the term it was appended in, and the caller's opaque
/// payload (already-encoded `LogEntry` bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftLogEntry {
    pub term: Term,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote {
        term: Term,
        candidate_id: ReplicaId,
        last_log_index: u64,
        last_log_term: Term,
    },
    RequestVoteReply {
        term: Term,
        vote_granted: bool,
        voter_id: ReplicaId,
    },
    AppendEntries {
        term: Term,
        leader_id: ReplicaId,
        prev_log_index: u64,
        prev_log_term: Term,
        entries: Vec<(Term, Vec<u8>)>,
        leader_commit: CommitIndex,
    },
    AppendEntriesReply {
        term: Term,
        success: bool,
        match_index: u64,
        follower_id: ReplicaId,
    },
}

/// Tick-driven Raft core for one replica of one shard.
pub struct RaftState {
    pub replica_id: ReplicaId,
    peers: Vec<ReplicaId>,
    pub role: Role,
    pub current_term: Term,
    voted_for: Option<ReplicaId>,
    log: Vec<RaftLogEntry>,
    pub commit_index: CommitIndex,
    pub current_leader: Option<ReplicaId>,

    next_index: HashMap<ReplicaId, u64>,
    match_index: HashMap<ReplicaId, u64>,
    votes_received: HashSet<ReplicaId>,

    election_timeout_ticks: u32,
    ticks_since_heard: u32,
    heartbeat_tick: u32,
    ticks_since_heartbeat: u32,
}

impl RaftState {
    pub fn new(replica_id: ReplicaId, peers: Vec<ReplicaId>, election_tick: u32, heartbeat_tick: u32) -> Self {
        let election_timeout_ticks = Self::randomized_timeout(election_tick);
        RaftState {
            replica_id,
            peers,
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            current_leader: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
            election_timeout_ticks,
            ticks_since_heard: 0,
            heartbeat_tick,
            ticks_since_heartbeat: 0,
        }
    }

    /// Randomize in `[base, 2*base)` ticks so peers don't all time out and
    /// start an election at once.
    fn randomized_timeout(base: u32) -> u32 {
        let mut rng = rand::thread_rng();
        base + rng.gen_range(0..base.max(1))
    }

    fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    fn last_log_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn become_follower(&mut self, term: Term) {
        self.role = Role::Follower;
        self.current_term = term;
        self.voted_for = None;
        self.votes_received.clear();
        self.ticks_since_heard = 0;
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.current_leader = Some(self.replica_id);
        let next = self.last_log_index() + 1;
        self.next_index = self.peers.iter().map(|p| (*p, next)).collect();
        self.match_index = self.peers.iter().map(|p| (*p, 0)).collect();
        self.ticks_since_heartbeat = self.heartbeat_tick;
    }

    fn start_election(&mut self) -> Vec<(ReplicaId, RaftMessage)> {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.replica_id);
        self.votes_received = [self.replica_id].into_iter().collect();
        self.ticks_since_heard = 0;
        self.election_timeout_ticks = Self::randomized_timeout(self.heartbeat_tick.max(1) * 10);

        if self.quorum_size() <= 1 {
            // Single-replica shard: trivially its own leader.
            self.become_leader();
            return Vec::new();
        }

        let msg = RaftMessage::RequestVote {
            term: self.current_term,
            candidate_id: self.replica_id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        self.peers.iter().map(|p| (*p, msg.clone())).collect()
    }

    /// Advance one tick. Returns outbound messages (election start or
    /// heartbeat replication).
    pub fn tick(&mut self) -> Vec<(ReplicaId, RaftMessage)> {
        match self.role {
            Role::Stopped => Vec::new(),
            Role::Follower | Role::Candidate => {
                self.ticks_since_heard += 1;
                if self.ticks_since_heard >= self.election_timeout_ticks {
                    self.start_election()
                } else {
                    Vec::new()
                }
            }
            Role::Leader => {
                self.ticks_since_heartbeat += 1;
                if self.ticks_since_heartbeat >= self.heartbeat_tick {
                    self.ticks_since_heartbeat = 0;
                    self.replicate_to_all()
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn replicate_to_all(&self) -> Vec<(ReplicaId, RaftMessage)> {
        self.peers
            .iter()
            .map(|peer| (*peer, self.replicate_message_for(*peer)))
            .collect()
    }

    fn replicate_message_for(&self, peer: ReplicaId) -> RaftMessage {
        let next = *self.next_index.get(&peer).unwrap_or(&(self.last_log_index() + 1));
        let prev_log_index = next.saturating_sub(1);
        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            self.log
                .get((prev_log_index - 1) as usize)
                .map(|e| e.term)
                .unwrap_or(0)
        };
        let entries = self.log[(next.saturating_sub(1)) as usize..]
            .iter()
            .map(|e| (e.term, e.data.clone()))
            .collect();
        RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.replica_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        }
    }

    /// Append one client entry. Only valid while leading; caller must
    /// follow up with `replicate_to_all` (via `tick` or by calling this
    /// and sending the returned messages) to push it to peers.
    pub fn append_entry(&mut self, data: Vec<u8>) -> Option<(u64, Vec<(ReplicaId, RaftMessage)>)> {
        if self.role != Role::Leader {
            return None;
        }
        self.log.push(RaftLogEntry {
            term: self.current_term,
            data,
        });
        let index = self.last_log_index();
        if self.peers.is_empty() {
            // Single-replica shard: the local write is already the quorum.
            self.commit_index = index;
        }
        Some((index, self.replicate_to_all()))
    }

    /// Process one inbound message. Returns outbound replies/messages and
    /// the inclusive range of newly committed log indices (1-based) the
    /// caller must apply, in order.
    pub fn handle_message(
        &mut self,
        from: ReplicaId,
        msg: RaftMessage,
    ) -> (Vec<(ReplicaId, RaftMessage)>, Vec<(CommitIndex, Term, Vec<u8>)>) {
        match msg {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                if term > self.current_term {
                    self.become_follower(term);
                }
                let log_ok = last_log_term > self.last_log_term()
                    || (last_log_term == self.last_log_term() && last_log_index >= self.last_log_index());
                let grant = term >= self.current_term
                    && (self.voted_for.is_none() || self.voted_for == Some(candidate_id))
                    && log_ok;
                if grant {
                    self.voted_for = Some(candidate_id);
                    self.ticks_since_heard = 0;
                }
                let reply = RaftMessage::RequestVoteReply {
                    term: self.current_term,
                    vote_granted: grant,
                    voter_id: self.replica_id,
                };
                (vec![(candidate_id, reply)], Vec::new())
            }
            RaftMessage::RequestVoteReply {
                term,
                vote_granted,
                voter_id,
            } => {
                if term > self.current_term {
                    self.become_follower(term);
                    return (Vec::new(), Vec::new());
                }
                if self.role == Role::Candidate && term == self.current_term && vote_granted {
                    self.votes_received.insert(voter_id);
                    if self.votes_received.len() >= self.quorum_size() {
                        self.become_leader();
                        return (self.replicate_to_all(), Vec::new());
                    }
                }
                (Vec::new(), Vec::new())
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                if term < self.current_term {
                    let reply = RaftMessage::AppendEntriesReply {
                        term: self.current_term,
                        success: false,
                        match_index: 0,
                        follower_id: self.replica_id,
                    };
                    return (vec![(leader_id, reply)], Vec::new());
                }
                if term > self.current_term || self.role != Role::Follower {
                    self.become_follower(term);
                }
                self.current_leader = Some(leader_id);
                self.ticks_since_heard = 0;

                let consistent = prev_log_index == 0
                    || self
                        .log
                        .get((prev_log_index - 1) as usize)
                        .map(|e| e.term == prev_log_term)
                        .unwrap_or(false);

                if !consistent {
                    let reply = RaftMessage::AppendEntriesReply {
                        term: self.current_term,
                        success: false,
                        match_index: 0,
                        follower_id: self.replica_id,
                    };
                    return (vec![(leader_id, reply)], Vec::new());
                }

                self.log.truncate(prev_log_index as usize);
                for (term, data) in entries {
                    self.log.push(RaftLogEntry { term, data });
                }

                let old_commit = self.commit_index;
                if leader_commit > self.commit_index {
                    self.commit_index = leader_commit.min(self.last_log_index());
                }
                let newly_committed = self.entries_between(old_commit, self.commit_index);

                let reply = RaftMessage::AppendEntriesReply {
                    term: self.current_term,
                    success: true,
                    match_index: self.last_log_index(),
                    follower_id: self.replica_id,
                };
                (vec![(leader_id, reply)], newly_committed)
            }
            RaftMessage::AppendEntriesReply {
                term,
                success,
                match_index,
                follower_id,
            } => {
                if term > self.current_term {
                    self.become_follower(term);
                    return (Vec::new(), Vec::new());
                }
                if self.role != Role::Leader || term != self.current_term {
                    return (Vec::new(), Vec::new());
                }
                if success {
                    self.match_index.insert(follower_id, match_index);
                    self.next_index.insert(follower_id, match_index + 1);
                    let old_commit = self.commit_index;
                    self.recompute_commit_index();
                    let newly_committed = self.entries_between(old_commit, self.commit_index);
                    (Vec::new(), newly_committed)
                } else {
                    let next = self.next_index.entry(follower_id).or_insert(1);
                    *next = next.saturating_sub(1).max(1);
                    let msg = self.replicate_message_for(follower_id);
                    (vec![(follower_id, msg)], Vec::new())
                }
            }
        }
    }

    /// Every committed entry after `from_exclusive` up to the current
    /// commit index. The driver calls this after every tick/message/append
    /// operation rather than threading committed entries through each
    /// call site individually.
    pub fn committed_entries_since(&self, from_exclusive: CommitIndex) -> Vec<(CommitIndex, Term, Vec<u8>)> {
        self.entries_between(from_exclusive, self.commit_index)
    }

    fn entries_between(&self, from_exclusive: CommitIndex, to_inclusive: CommitIndex) -> Vec<(CommitIndex, Term, Vec<u8>)> {
        ((from_exclusive + 1)..=to_inclusive)
            .filter_map(|idx| {
                self.log
                    .get((idx - 1) as usize)
                    .map(|e| (idx, e.term, e.data.clone()))
            })
            .collect()
    }

    /// Only entries from the current term are committed directly (the
    /// standard Raft safety rule); earlier-term entries are committed
    /// transitively once a later entry at the same index-or-beyond is.
    fn recompute_commit_index(&mut self) {
        let mut match_indices: Vec<u64> = self.match_index.values().copied().collect();
        match_indices.push(self.last_log_index());
        match_indices.sort_unstable();
        let majority_index = match_indices[match_indices.len() - self.quorum_size()];

        if majority_index > self.commit_index {
            if let Some(entry) = self.log.get((majority_index - 1) as usize) {
                if entry.term == self.current_term {
                    self.commit_index = majority_index;
                }
            }
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn stop(&mut self) {
        self.role = Role::Stopped;
    }
}
