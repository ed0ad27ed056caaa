//! Scenario 4 (§8): once the log passes the snapshot threshold the leader
//! compacts it; a follower that was offline during the bulk commit catches
//! up via InstallSnapshot instead of a multi-thousand-entry replay.

mod common;

use std::collections::HashMap;
use std::rc::Rc;

use bytes::Bytes;
use little_raft_engine::{Io, Options, Raft};

use common::{id, pump, tick_all, voters_config, Hub, TestIo, VecFsm};

type Engine = Raft<TestIo, VecFsm>;

fn start_cluster(hub: &Rc<Hub>, ids: &[u64], options: Options) -> HashMap<u64, Engine> {
    let config = voters_config(ids);
    let mut engines = HashMap::new();
    for &n in ids {
        let mut io = TestIo::new(id(n), hub.clone());
        io.bootstrap(&config).unwrap();
        let mut engine = Raft::new(id(n), format!("127.0.0.1:{}", 9000 + n), options.clone(), io, VecFsm::default()).unwrap();
        engine.start().unwrap();
        engines.insert(n, engine);
    }
    engines
}

fn elect_a_leader(hub: &Rc<Hub>, engines: &mut HashMap<u64, Engine>, options: &Options, rounds: u64) -> u64 {
    for round in 1..=rounds {
        tick_all(hub, engines, options.election_timeout * round);
        if let Some((&n, _)) = engines.iter().find(|(_, e)| e.is_leader()) {
            return n;
        }
    }
    panic!("no leader elected within the round budget");
}

#[test]
fn offline_follower_catches_up_via_install_snapshot() {
    let options = Options {
        snapshot_threshold: 1024,
        snapshot_trailing: 0,
        ..Options::default()
    };
    let hub = Hub::new();
    let ids = [1, 2, 3];
    let mut engines = start_cluster(&hub, &ids, options.clone());

    let leader_id = elect_a_leader(&hub, &mut engines, &options, 20);
    hub.partition(3, leader_id);
    hub.partition(3, *ids.iter().find(|&&n| n != 3 && n != leader_id).unwrap());

    let committed = Rc::new(std::cell::Cell::new(false));
    {
        let committed = committed.clone();
        let payloads: Vec<Bytes> = (0..2000).map(|i| Bytes::from(format!("e{i}"))).collect();
        let leader = engines.get_mut(&leader_id).unwrap();
        leader
            .apply(
                payloads,
                Box::new(move |r| {
                    r.unwrap();
                    committed.set(true);
                }),
            )
            .unwrap();
    }

    for _ in 0..200 {
        pump(&hub, &mut engines, 64);
        tick_all(&hub, &mut engines, options.heartbeat_timeout);
        if committed.get() {
            break;
        }
    }
    assert!(committed.get(), "2000 entries should commit with a 2-of-3 quorum excluding the offline follower");

    // Give the leader a chance to notice it crossed the snapshot threshold
    // and to finish persisting + discarding its log.
    for _ in 0..10 {
        tick_all(&hub, &mut engines, options.heartbeat_timeout);
        pump(&hub, &mut engines, 64);
    }

    {
        let leader = &engines[&leader_id];
        assert_eq!(leader.last_applied(), 2001, "bootstrap config + 2000 commands");
    }

    hub.heal(3, leader_id);
    hub.heal(3, *ids.iter().find(|&&n| n != 3 && n != leader_id).unwrap());

    for _ in 0..50 {
        tick_all(&hub, &mut engines, options.heartbeat_timeout);
        pump(&hub, &mut engines, 64);
        if engines[&3].last_applied() >= 2001 {
            break;
        }
    }
    assert_eq!(engines[&3].last_applied(), 2001, "follower 3 should have caught up via InstallSnapshot");
    assert_eq!(
        engines[&3].fsm().applied.len(),
        2000,
        "follower 3's FSM should hold every command after restoring the snapshot"
    );

    // Subsequent AppendEntries still reach it normally.
    let more_committed = Rc::new(std::cell::Cell::new(false));
    {
        let more_committed = more_committed.clone();
        let leader = engines.get_mut(&leader_id).unwrap();
        leader
            .apply(
                vec![Bytes::from_static(b"after-snapshot")],
                Box::new(move |r| {
                    r.unwrap();
                    more_committed.set(true);
                }),
            )
            .unwrap();
    }
    for _ in 0..20 {
        tick_all(&hub, &mut engines, options.heartbeat_timeout);
        pump(&hub, &mut engines, 64);
        if more_committed.get() {
            break;
        }
    }
    assert!(more_committed.get());
    for _ in 0..20 {
        tick_all(&hub, &mut engines, options.heartbeat_timeout);
        pump(&hub, &mut engines, 64);
        if engines[&3].fsm().applied.contains(&"after-snapshot".to_string()) {
            break;
        }
    }
    assert!(engines[&3].fsm().applied.contains(&"after-snapshot".to_string()));
}
