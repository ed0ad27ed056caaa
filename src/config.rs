//! Cluster configuration (component C1): the set of servers participating in
//! consensus, their addresses and roles, plus the stable binary encoding used
//! to store a configuration as a log entry payload.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::types::{server_id, LogIndex, ServerId};

/// A server's role within a configuration.
///
/// `Voter`s count toward quorum and receive replicated entries; `Standby`s
/// receive entries but never vote or count toward quorum; `Idle` servers
/// receive nothing and exist only so the cluster remembers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Voter,
    Standby,
    Idle,
}

impl Role {
    fn to_wire(self) -> u8 {
        match self {
            Role::Voter => 0,
            Role::Standby => 1,
            Role::Idle => 2,
        }
    }

    fn from_wire(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Role::Voter),
            1 => Ok(Role::Standby),
            2 => Ok(Role::Idle),
            _ => Err(RaftError::BadRole),
        }
    }
}

/// One member of a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub address: String,
    pub role: Role,
}

/// The set of servers known to a Raft instance at a point in time.
///
/// Insertion order is preserved since it is significant for the binary
/// encoding and for deterministic test output; lookups are by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    servers: Vec<Server>,
}

const WIRE_VERSION: u8 = 1;

impl Configuration {
    pub fn init() -> Self {
        Self::default()
    }

    /// Configurations own no external resources; kept for symmetry with the
    /// other capabilities' `init`/`close` pair.
    pub fn close(&mut self) {
        self.servers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn add(&mut self, id: u64, address: impl Into<String>, role: Role) -> Result<()> {
        let id = server_id(id)?;
        let address = address.into();
        if self.servers.iter().any(|s| s.id == id) {
            return Err(RaftError::DuplicateId(id.get()));
        }
        if self.servers.iter().any(|s| s.address == address) {
            return Err(RaftError::DuplicateAddress(address));
        }
        self.servers.push(Server { id, address, role });
        Ok(())
    }

    pub fn remove(&mut self, id: ServerId) -> Result<Server> {
        let pos = self
            .servers
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| RaftError::NotFound(format!("server {id}")))?;
        Ok(self.servers.remove(pos))
    }

    pub fn get(&self, id: ServerId) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: ServerId) -> Option<&mut Server> {
        self.servers.iter_mut().find(|s| s.id == id)
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.get(id).is_some()
    }

    pub fn servers(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter()
    }

    pub fn voters(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter().filter(|s| s.role == Role::Voter)
    }

    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    /// `⌊V/2⌋ + 1` where V is the voter count.
    pub fn quorum(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    /// Whether `match_indices` (keyed by voter id, entries for non-voters are
    /// ignored) shows a strict majority of voters at or past `index`.
    pub fn has_quorum_at(&self, index: LogIndex, match_indices: &HashMap<ServerId, LogIndex>) -> bool {
        let have = self
            .voters()
            .filter(|s| match_indices.get(&s.id).copied().unwrap_or(0) >= index)
            .count();
        have >= self.quorum()
    }

    /// Stable binary layout: version byte, varint server count, then per
    /// server `{id: u64 LE, role: u8, address: NUL-terminated UTF-8}`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(WIRE_VERSION);
        put_varint(&mut buf, self.servers.len() as u64);
        for server in &self.servers {
            buf.put_u64_le(server.id.get());
            buf.put_u8(server.role.to_wire());
            buf.put_slice(server.address.as_bytes());
            buf.put_u8(0);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(RaftError::MalformedMessage("empty configuration buffer".into()));
        }
        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(RaftError::MalformedMessage(format!(
                "unsupported configuration version {version}"
            )));
        }
        let count = get_varint(&mut buf)?;
        let mut servers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if buf.remaining() < 9 {
                return Err(RaftError::MalformedMessage("truncated configuration".into()));
            }
            let id = buf.get_u64_le();
            let role = Role::from_wire(buf.get_u8())?;
            let nul = buf
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| RaftError::MalformedMessage("unterminated address".into()))?;
            let address = String::from_utf8(buf[..nul].to_vec())
                .map_err(|e| RaftError::MalformedMessage(e.to_string()))?;
            buf.advance(nul + 1);
            let id = server_id(id)?;
            servers.push(Server { id, address, role });
        }
        Ok(Configuration { servers })
    }
}

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

fn get_varint(buf: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if buf.is_empty() {
            return Err(RaftError::MalformedMessage("truncated varint".into()));
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(RaftError::MalformedMessage("varint too long".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let mut config = Configuration::init();
        config.add(1, "127.0.0.1:8001", Role::Voter).unwrap();
        config.add(2, "127.0.0.1:8002", Role::Voter).unwrap();
        config.add(3, "127.0.0.1:8003", Role::Standby).unwrap();

        let encoded = config.encode();
        let decoded = Configuration::decode(&encoded).unwrap();
        assert_eq!(config, decoded);
    }

    #[test]
    fn rejects_duplicate_id_and_address() {
        let mut config = Configuration::init();
        config.add(1, "a", Role::Voter).unwrap();
        assert_eq!(config.add(1, "b", Role::Voter), Err(RaftError::DuplicateId(1)));
        assert_eq!(
            config.add(2, "a", Role::Voter),
            Err(RaftError::DuplicateAddress("a".into()))
        );
    }

    #[test]
    fn quorum_is_majority_of_voters() {
        let mut config = Configuration::init();
        for id in 1..=5 {
            config.add(id, format!("addr{id}"), Role::Voter).unwrap();
        }
        config.add(6, "standby", Role::Standby).unwrap();
        assert_eq!(config.quorum(), 3);
    }

    #[test]
    fn zero_id_is_rejected() {
        let mut config = Configuration::init();
        assert!(matches!(config.add(0, "a", Role::Voter), Err(RaftError::BadId(_))));
    }
}
