//! Scenario 1 (§8): a lone voter elects itself leader without waiting for
//! any peer.

mod common;

use little_raft_engine::{Io, Options, Raft};

use common::{id, voters_config, Hub, TestIo, VecFsm};

#[test]
fn single_voter_self_elects_on_start() {
    let hub = Hub::new();
    let config = voters_config(&[1]);

    let mut io = TestIo::new(id(1), hub.clone());
    io.bootstrap(&config).unwrap();

    let mut engine = Raft::new(id(1), "127.0.0.1:9001", Options::default(), io, VecFsm::default()).unwrap();
    engine.start().unwrap();

    // Sole voter: §3 Lifecycle says `start` becomes Leader outright, with no
    // need to wait out an election timeout first.
    assert!(engine.is_leader());
    assert_eq!(engine.current_term(), 1);
    assert_eq!(engine.leader_id(), Some(id(1)));

    // Stays leader across further ticks with nobody to contest it.
    let now = hub.advance(Options::default().election_timeout * 2);
    engine.tick(now).unwrap();
    assert!(engine.is_leader());
    assert_eq!(engine.current_term(), 1);
}
