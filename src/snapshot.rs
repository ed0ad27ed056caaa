//! Snapshot coordinator (component C9): taking a local snapshot once the
//! log has grown past `snapshot_threshold`, sending one to a lagging
//! follower, and installing one received from the leader.
//!
//! Grounded in the teacher's `RaftNode::create_snapshot`/`install_snapshot`
//! (`clustering/raft.rs`) for the threshold-check shape, generalized to
//! route through the `Fsm`/`Io` capability boundary instead of an in-process
//! state machine.

use bytes::{Bytes, BytesMut};
use tracing::{info, warn};

use crate::error::Result;
use crate::io::{Fsm, Io, Token};
use crate::log::SnapshotMeta;
use crate::raft::Raft;
use crate::rpc::{Envelope, InstallSnapshot, InstallSnapshotResult, Message};
use crate::types::{Millis, ServerId};

impl<I: Io, F: Fsm> Raft<I, F> {
    /// Check the snapshot threshold and kick off a local snapshot if due
    /// (§4.7(d), §4.9).
    pub(crate) fn check_snapshot_threshold(&mut self, _now: Millis) -> Result<()> {
        if self.inflight_snapshot_put.is_some() {
            return Ok(());
        }
        let boundary = self.log.snapshot().map(|s| s.last_index).unwrap_or(0);
        if self.last_applied.saturating_sub(boundary) < self.options.snapshot_threshold {
            return Ok(());
        }
        self.take_snapshot()
    }

    fn take_snapshot(&mut self) -> Result<()> {
        let chunks = self.fsm.snapshot()?;
        let mut buf = BytesMut::new();
        for chunk in chunks {
            buf.extend_from_slice(&chunk);
        }
        let meta = SnapshotMeta {
            last_index: self.last_applied,
            last_term: self.log.term_of(self.last_applied).unwrap_or(0),
            configuration: self.committed_config.clone(),
            configuration_index: self.committed_config_index,
        };
        let token = self.io.snapshot_put(meta.clone(), buf.freeze())?;
        self.inflight_snapshot_put = Some(token);
        self.pending_snapshot_meta = Some(meta);
        Ok(())
    }

    pub(crate) fn on_snapshot_put_complete(&mut self, token: Token, ok: bool) {
        if self.inflight_snapshot_put != Some(token) {
            return;
        }
        self.inflight_snapshot_put = None;
        let meta = match self.pending_snapshot_meta.take() {
            Some(meta) => meta,
            None => return,
        };
        if !ok {
            warn!(id = self.id.get(), "snapshot persist failed");
            self.set_errmsg("snapshot persist failed");
            return;
        }
        let trailing = self.options.snapshot_trailing;
        self.log.set_snapshot_meta(meta.clone());
        let keep_from = meta.last_index.saturating_sub(trailing) + 1;
        self.log.discard_before(keep_from);
        info!(id = self.id.get(), last_index = meta.last_index, "local snapshot taken");
    }

    /// A peer's `next_index - 1` has fallen behind the retained log window;
    /// fetch the current snapshot from the I/O for transmission (§4.3
    /// Probe/Pipeline → Snapshot transition).
    pub(crate) fn begin_snapshot_send(&mut self, peer: ServerId, _now: Millis) -> Result<()> {
        let meta = match self.log.snapshot() {
            Some(meta) => meta.clone(),
            None => return Ok(()), // nothing to send; leader will retry once it has one
        };
        if let crate::raft::Role::Leader(leader) = &mut self.role {
            if let Some(p) = leader.progress.get_mut(peer) {
                p.become_snapshot(meta.last_index);
            }
        }
        let token = self.io.snapshot_get(meta)?;
        self.inflight_snapshot_get = Some((token, peer));
        Ok(())
    }

    pub(crate) fn on_snapshot_get_complete(&mut self, token: Token, data: Option<Bytes>) -> Result<()> {
        let (expected_token, peer) = match self.inflight_snapshot_get {
            Some(pair) if pair.0 == token => pair,
            _ => return Ok(()),
        };
        let _ = expected_token;
        self.inflight_snapshot_get = None;
        let data = match data {
            Some(data) => data,
            None => {
                warn!(id = self.id.get(), peer = peer.get(), "snapshot fetch failed");
                return Ok(());
            }
        };
        let meta = match self.log.snapshot() {
            Some(meta) => meta.clone(),
            None => return Ok(()),
        };
        let message = Message::InstallSnapshot(InstallSnapshot {
            term: self.current_term,
            leader_id: self.id,
            last_index: meta.last_index,
            last_term: meta.last_term,
            configuration: meta.configuration.encode().to_vec(),
            configuration_index: meta.configuration_index,
            data: data.to_vec(),
        });
        let _ = self.io.send(Envelope { to: peer, message })?;
        Ok(())
    }

    /// Receive an InstallSnapshot as a follower (§4.9).
    pub(crate) fn handle_install_snapshot(&mut self, from: ServerId, msg: InstallSnapshot, now: Millis) -> Result<()> {
        self.observe_term(msg.term, now)?;
        if msg.term < self.current_term {
            let result = Message::InstallSnapshotResult(InstallSnapshotResult {
                term: self.current_term,
                success: false,
            });
            let _ = self.io.send(Envelope { to: from, message: result })?;
            return Ok(());
        }
        self.become_follower(now, Some(from));

        if msg.last_index <= self.commit_index {
            let result = Message::InstallSnapshotResult(InstallSnapshotResult {
                term: self.current_term,
                success: true,
            });
            let _ = self.io.send(Envelope { to: from, message: result })?;
            return Ok(());
        }

        let configuration = crate::config::Configuration::decode(&msg.configuration)?;
        let meta = SnapshotMeta {
            last_index: msg.last_index,
            last_term: msg.last_term,
            configuration: configuration.clone(),
            configuration_index: msg.configuration_index,
        };
        let data: Bytes = msg.data.into();
        let token = self.io.snapshot_put(meta.clone(), data.clone())?;
        self.inflight_install = Some(token);
        self.pending_snapshot_meta = Some(meta);
        self.pending_snapshot_data = Some(data);
        Ok(())
    }

    pub(crate) fn on_install_complete(&mut self, token: Token, ok: bool) -> Result<()> {
        if self.inflight_install != Some(token) {
            return Ok(());
        }
        self.inflight_install = None;
        let meta = match self.pending_snapshot_meta.take() {
            Some(meta) => meta,
            None => return Ok(()),
        };
        if !ok {
            warn!(id = self.id.get(), "snapshot install failed");
            self.set_errmsg("snapshot install failed");
            return Ok(());
        }
        self.log.install_snapshot(meta.clone());
        self.committed_config = meta.configuration;
        self.committed_config_index = meta.configuration_index;
        let data = self.pending_snapshot_data.take().unwrap_or_default();
        self.fsm.restore(&data)?;
        self.last_applied = meta.last_index;
        self.commit_index = meta.last_index;
        self.last_stored = meta.last_index;
        info!(id = self.id.get(), last_index = meta.last_index, "snapshot installed");
        Ok(())
    }
}
