//! Election module (component C4): campaign start, vote granting and
//! collection, and leadership transfer.
//!
//! Grounded in the teacher's `ElectionManager` (`networking/membership/raft/
//! election.rs`) for the tracing call shapes and the `start_election`/
//! `step_down`/`transfer_leadership` split, generalized to the two-phase
//! pre-vote/election campaign and the `disrupt_leader` rule this
//! specification adds on top.

use tracing::{debug, info};

use crate::error::Result;
use crate::io::{Fsm, Io};
use crate::raft::{CandidatePhase, Raft, Role};
use crate::rpc::{Envelope, Message, RequestVote, RequestVoteResult, TimeoutNow};
use crate::types::{Millis, ServerId};

impl<I: Io, F: Fsm> Raft<I, F> {
    fn broadcast_to_voters(&mut self, build: impl Fn(ServerId) -> Message) -> Result<()> {
        let targets: Vec<ServerId> = self
            .committed_config
            .voters()
            .filter(|s| s.id != self.id)
            .map(|s| s.id)
            .collect();
        for to in targets {
            let message = build(to);
            let _ = self.io.send(Envelope { to, message })?;
        }
        Ok(())
    }

    /// Entry point after [`Raft::become_candidate`]: runs whichever phase the
    /// fresh `CandidateState` is in.
    pub(crate) fn campaign(&mut self, now: Millis) -> Result<()> {
        let (phase, disrupt_leader) = match &self.role {
            Role::Candidate(c) => (c.phase, c.disrupt_leader),
            _ => return Ok(()),
        };
        match phase {
            CandidatePhase::PreVote => self.start_pre_vote(now, disrupt_leader),
            CandidatePhase::Election => self.start_election(now, disrupt_leader),
        }
    }

    fn candidate_last_log(&self) -> (u64, u64) {
        let last_index = self.log.last_index();
        let last_term = self.log.last_term();
        (last_index, last_term)
    }

    /// A non-disruptive round at `current_term + 1` that never actually
    /// advances `current_term`; only a quorum of affirmative replies
    /// triggers the real election (§10 supplement, `pre_vote`).
    fn start_pre_vote(&mut self, now: Millis, disrupt_leader: bool) -> Result<()> {
        if let Role::Candidate(c) = &mut self.role {
            c.votes.clear();
            c.votes.insert(self.id, true);
        }
        let (last_log_index, last_log_term) = self.candidate_last_log();
        let term = self.current_term + 1;
        let candidate_id = self.id;
        debug!(id = self.id.get(), term, "starting pre-vote round");
        self.broadcast_to_voters(|_| {
            Message::RequestVote(RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
                disrupt_leader,
                pre_vote: true,
            })
        })?;
        self.maybe_win_campaign(now)
    }

    fn start_election(&mut self, now: Millis, disrupt_leader: bool) -> Result<()> {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.io.set_term(self.current_term, Some(self.id))?;
        if let Role::Candidate(c) = &mut self.role {
            c.votes.clear();
            c.votes.insert(self.id, true);
        }
        self.reset_election_timer(now);

        info!(id = self.id.get(), term = self.current_term, "starting election");
        let (last_log_index, last_log_term) = self.candidate_last_log();
        let term = self.current_term;
        let candidate_id = self.id;
        self.broadcast_to_voters(|_| {
            Message::RequestVote(RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
                disrupt_leader,
                pre_vote: false,
            })
        })?;
        self.maybe_win_campaign(now)
    }

    /// A lone voter wins its own campaign without waiting for replies.
    fn maybe_win_campaign(&mut self, now: Millis) -> Result<()> {
        let quorum = self.committed_config.quorum();
        let phase_and_votes = match &self.role {
            Role::Candidate(c) => Some((c.phase, c.votes.values().filter(|v| **v).count())),
            _ => None,
        };
        if let Some((phase, yes)) = phase_and_votes {
            if yes >= quorum {
                match phase {
                    CandidatePhase::PreVote => {
                        let disrupt_leader = matches!(&self.role, Role::Candidate(c) if c.disrupt_leader);
                        self.become_candidate(now, disrupt_leader);
                        self.campaign(now)?;
                    }
                    CandidatePhase::Election => self.become_leader(now)?,
                }
            }
        }
        Ok(())
    }

    pub(crate) fn handle_request_vote(&mut self, from: ServerId, msg: RequestVote, now: Millis) -> Result<()> {
        // Snapshot the disruption check against our state as it stood
        // *before* this message touches anything — a pre-vote probe or a
        // stepped-down-and-adopted term must not erase the evidence that we
        // had a live leader a moment ago (§10 supplement, `disrupt_leader`).
        let recently_heard_from_leader = matches!(&self.role, Role::Follower(f)
            if f.leader_id.is_some() && now < f.election_deadline);

        // A pre-vote probe is evaluated exactly like a real request but must
        // never adopt `term` or record a vote: nothing about it is durable,
        // it only tells the prospective candidate whether a real campaign
        // would likely succeed.
        if !msg.pre_vote {
            self.observe_term(msg.term, now)?;
        }

        let (last_index, last_term) = self.candidate_last_log();
        let candidate_up_to_date =
            msg.last_log_term > last_term || (msg.last_log_term == last_term && msg.last_log_index >= last_index);

        let grant = msg.term >= self.current_term
            && (msg.pre_vote || self.voted_for.is_none() || self.voted_for == Some(msg.candidate_id))
            && candidate_up_to_date
            && (msg.disrupt_leader || !recently_heard_from_leader);

        if grant && !msg.pre_vote && msg.term == self.current_term {
            self.voted_for = Some(msg.candidate_id);
            self.io.set_term(self.current_term, self.voted_for)?;
            self.reset_election_timer(now);
        }

        debug!(
            id = self.id.get(),
            candidate = msg.candidate_id.get(),
            term = msg.term,
            granted = grant,
            "handled vote request"
        );

        let result = Message::RequestVoteResult(RequestVoteResult {
            term: self.current_term,
            vote_granted: grant,
        });
        let _ = self.io.send(Envelope { to: from, message: result })?;
        Ok(())
    }

    pub(crate) fn handle_request_vote_result(&mut self, from: ServerId, msg: RequestVoteResult, now: Millis) -> Result<()> {
        if msg.term > self.current_term {
            return self.observe_term(msg.term, now);
        }
        if let Role::Candidate(c) = &mut self.role {
            if msg.term == self.current_term || c.phase == CandidatePhase::PreVote {
                c.votes.insert(from, msg.vote_granted);
            }
        }
        self.maybe_win_campaign(now)
    }

    pub(crate) fn send_timeout_now(&mut self, target: ServerId) -> Result<()> {
        let message = Message::TimeoutNow(TimeoutNow {
            term: self.current_term,
            leader_id: self.id,
        });
        let _ = self.io.send(Envelope { to: target, message })?;
        Ok(())
    }

    pub(crate) fn handle_timeout_now(&mut self, msg: TimeoutNow, now: Millis) -> Result<()> {
        self.observe_term(msg.term, now)?;
        if msg.term < self.current_term {
            return Ok(());
        }
        info!(id = self.id.get(), "received TimeoutNow, starting disruptive election");
        self.become_candidate(now, true);
        self.campaign(now)
    }

    /// Check the timer carried by the follower/candidate substate and start
    /// the next campaign phase if it has elapsed (§4.4, driven by §4.7).
    pub(crate) fn check_election_timeout(&mut self, now: Millis) -> Result<()> {
        let elapsed = match &self.role {
            Role::Follower(f) => now >= f.election_deadline,
            Role::Candidate(c) => now >= c.election_deadline,
            Role::Leader(_) => false,
        };
        if !elapsed {
            return Ok(());
        }
        match &self.role {
            Role::Follower(_) => {
                self.become_candidate(now, false);
                self.campaign(now)
            }
            Role::Candidate(_) => {
                self.become_candidate(now, false);
                self.campaign(now)
            }
            Role::Leader(_) => Ok(()),
        }
    }
}
