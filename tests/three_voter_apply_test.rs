//! Scenario 2 (§8): a three-voter cluster elects a leader, then a client
//! `apply` commits and is visible on every server's state machine.

mod common;

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use bytes::Bytes;
use little_raft_engine::{Io, Options, Raft};

use common::{id, pump, tick_all, voters_config, Hub, TestIo, VecFsm};

type Engine = Raft<TestIo, VecFsm>;

fn start_cluster(hub: &Rc<Hub>, ids: &[u64]) -> HashMap<u64, Engine> {
    let config = voters_config(ids);
    let mut engines = HashMap::new();
    for &n in ids {
        let mut io = TestIo::new(id(n), hub.clone());
        io.bootstrap(&config).unwrap();
        let mut engine = Raft::new(id(n), format!("127.0.0.1:{}", 9000 + n), Options::default(), io, VecFsm::default()).unwrap();
        engine.start().unwrap();
        engines.insert(n, engine);
    }
    engines
}

fn elect_a_leader(hub: &Rc<Hub>, engines: &mut HashMap<u64, Engine>) -> u64 {
    for round in 1..=20 {
        tick_all(hub, engines, Options::default().election_timeout * round);
        if let Some((&n, _)) = engines.iter().find(|(_, e)| e.is_leader()) {
            return n;
        }
    }
    panic!("no leader elected within the round budget");
}

#[test]
fn apply_commits_and_is_visible_everywhere() {
    let hub = Hub::new();
    let mut engines = start_cluster(&hub, &[1, 2, 3]);

    let leader_id = elect_a_leader(&hub, &mut engines);

    let applied: Rc<Cell<bool>> = Rc::new(Cell::new(false));
    let applied_clone = applied.clone();
    {
        let leader = engines.get_mut(&leader_id).unwrap();
        leader
            .apply(
                vec![Bytes::from_static(b"x")],
                Box::new(move |result| {
                    let values = result.expect("apply should succeed on the leader");
                    assert_eq!(values, vec!["x".to_string()]);
                    applied_clone.set(true);
                }),
            )
            .unwrap();
    }

    pump(&hub, &mut engines, 64);
    // A heartbeat/tick round gives followers' replies a chance to land even
    // if `pump` alone settles first.
    tick_all(&hub, &mut engines, Options::default().heartbeat_timeout);
    pump(&hub, &mut engines, 64);

    assert!(applied.get(), "leader's apply callback should have fired");

    for (&n, engine) in engines.iter() {
        assert_eq!(engine.last_applied(), 2, "server {n} should have applied the bootstrap config and the command");
        assert_eq!(engine.fsm().applied, vec!["x".to_string()], "server {n} should hold \"x\" applied exactly once");
    }
}
