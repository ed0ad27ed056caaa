//! Shared scenario-test harness: an in-memory `Io`/`Fsm` pair per simulated
//! server, a message-routing hub that can partition/heal links, and a
//! deterministic virtual clock. Follows the teacher's
//! `tests/cluster_10_node_test.rs` shape (harness struct, builder-style node
//! configs, assertions against the public engine API) but drives the real
//! engine instead of simulating role transitions by hand.
//!
//! `TestIo`'s async methods complete instantly (this is all in-process
//! memory), but per §5 the engine must still be told so via `complete()` —
//! it never reaches into its own `Io` for the result. Each `TestIo` pushes
//! the matching [`Completion`] onto its server's queue in the `Hub`, and
//! `pump`/`tick_all` drain those queues and hand them to the engine, exactly
//! as a real driver would after polling its own I/O.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroU64;
use std::rc::Rc;

use bytes::Bytes;
use little_raft_engine::{
    Completion, Configuration, Entry, Fsm, Io, LoadResult, Message, RaftError, Role as ConfigRole,
    ServerId, SnapshotMeta, Token,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

struct Pending {
    to: ServerId,
    from: ServerId,
    message: Message,
}

/// A virtual network and completion-delivery point shared by every
/// simulated server's `Io`, with the ability to sever and restore links
/// between two ids.
pub struct Hub {
    queue: RefCell<VecDeque<Pending>>,
    completions: RefCell<HashMap<u64, VecDeque<Completion>>>,
    partitioned: RefCell<HashSet<(u64, u64)>>,
    now: RefCell<u64>,
    next_token: RefCell<Token>,
}

impl Hub {
    pub fn new() -> Rc<Hub> {
        Rc::new(Hub {
            queue: RefCell::new(VecDeque::new()),
            completions: RefCell::new(HashMap::new()),
            partitioned: RefCell::new(HashSet::new()),
            now: RefCell::new(0),
            next_token: RefCell::new(1),
        })
    }

    fn linked(&self, a: u64, b: u64) -> bool {
        let p = self.partitioned.borrow();
        !p.contains(&(a, b)) && !p.contains(&(b, a))
    }

    pub fn partition(&self, a: u64, b: u64) {
        self.partitioned.borrow_mut().insert((a, b));
    }

    pub fn heal(&self, a: u64, b: u64) {
        self.partitioned.borrow_mut().remove(&(a, b));
        self.partitioned.borrow_mut().remove(&(b, a));
    }

    pub fn now(&self) -> u64 {
        *self.now.borrow()
    }

    pub fn advance(&self, by: u64) -> u64 {
        let mut now = self.now.borrow_mut();
        *now += by;
        *now
    }

    fn alloc_token(&self) -> Token {
        let mut next = self.next_token.borrow_mut();
        let token = *next;
        *next += 1;
        token
    }

    fn push_completion(&self, server: u64, completion: Completion) {
        self.completions.borrow_mut().entry(server).or_default().push_back(completion);
    }

    fn drain_completions(&self, server: u64) -> Vec<Completion> {
        match self.completions.borrow_mut().get_mut(&server) {
            Some(q) => q.drain(..).collect(),
            None => Vec::new(),
        }
    }

    fn drain_messages(&self) -> Vec<(ServerId, ServerId, Message)> {
        let mut out = Vec::new();
        let mut queue = self.queue.borrow_mut();
        while let Some(pending) = queue.pop_front() {
            if self.linked(pending.from.get(), pending.to.get()) {
                out.push((pending.to, pending.from, pending.message));
            }
        }
        out
    }
}

/// A simulated server's storage, exposed separately from `TestIo` so a test
/// can inspect persisted state without punching through the engine's API.
pub struct MemStore {
    pub current_term: u64,
    pub voted_for: Option<ServerId>,
    pub entries: Vec<Entry>,
    pub start_index: u64,
    pub snapshot: Option<(SnapshotMeta, Bytes)>,
}

impl MemStore {
    fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            entries: Vec::new(),
            start_index: 1,
            snapshot: None,
        }
    }
}

pub struct TestIo {
    pub id: ServerId,
    hub: Rc<Hub>,
    store: Rc<RefCell<MemStore>>,
    rng: StdRng,
}

impl TestIo {
    pub fn new(id: ServerId, hub: Rc<Hub>) -> Self {
        Self {
            id,
            hub,
            store: Rc::new(RefCell::new(MemStore::new())),
            // Seeded from the server id so a scenario's outcome is
            // reproducible across runs, mirroring the teacher's
            // `rand::thread_rng().gen_range(..)` but deterministic.
            rng: StdRng::seed_from_u64(id.get()),
        }
    }

    pub fn store(&self) -> Rc<RefCell<MemStore>> {
        self.store.clone()
    }
}

impl Io for TestIo {
    fn init(&mut self) -> little_raft_engine::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> little_raft_engine::Result<()> {
        Ok(())
    }

    fn load(&mut self) -> little_raft_engine::Result<LoadResult> {
        let store = self.store.borrow();
        Ok(LoadResult {
            current_term: store.current_term,
            voted_for: store.voted_for,
            snapshot: store.snapshot.as_ref().map(|(meta, _)| meta.clone()),
            snapshot_data: store.snapshot.as_ref().map(|(_, data)| data.clone()),
            start_index: store.start_index,
            entries: store.entries.clone(),
        })
    }

    fn bootstrap(&mut self, configuration: &Configuration) -> little_raft_engine::Result<()> {
        let mut store = self.store.borrow_mut();
        store.entries.push(Entry::new(
            1,
            little_raft_engine::EntryKind::ConfigChange,
            configuration.encode(),
        ));
        Ok(())
    }

    fn recover(&mut self, _configuration: &Configuration) -> little_raft_engine::Result<()> {
        Ok(())
    }

    fn set_term(&mut self, term: u64, voted_for: Option<ServerId>) -> little_raft_engine::Result<()> {
        let mut store = self.store.borrow_mut();
        store.current_term = term;
        store.voted_for = voted_for;
        Ok(())
    }

    fn truncate(&mut self, index: u64) -> little_raft_engine::Result<()> {
        let mut store = self.store.borrow_mut();
        let cut = index.saturating_sub(store.start_index) as usize;
        store.entries.truncate(cut);
        Ok(())
    }

    fn time(&self) -> u64 {
        self.hub.now()
    }

    fn random(&mut self, low: u64, high: u64) -> u64 {
        let span = (high - low).max(1);
        low + self.rng.gen_range(0..span)
    }

    fn append(&mut self, entries: Vec<Entry>) -> little_raft_engine::Result<Token> {
        let mut store = self.store.borrow_mut();
        store.entries.extend(entries);
        let token = self.hub.alloc_token();
        self.hub.push_completion(self.id.get(), Completion::Append { token, ok: true });
        Ok(token)
    }

    fn send(&mut self, envelope: little_raft_engine::Envelope) -> little_raft_engine::Result<Token> {
        self.hub.queue.borrow_mut().push_back(Pending {
            to: envelope.to,
            from: self.id,
            message: envelope.message,
        });
        let token = self.hub.alloc_token();
        self.hub.push_completion(self.id.get(), Completion::Send { token, ok: true });
        Ok(token)
    }

    fn snapshot_put(&mut self, meta: SnapshotMeta, chunk: Bytes) -> little_raft_engine::Result<Token> {
        let mut store = self.store.borrow_mut();
        store.snapshot = Some((meta, chunk));
        let token = self.hub.alloc_token();
        self.hub.push_completion(self.id.get(), Completion::SnapshotPut { token, ok: true });
        Ok(token)
    }

    fn snapshot_get(&mut self, _meta: SnapshotMeta) -> little_raft_engine::Result<Token> {
        let data = self.store.borrow().snapshot.as_ref().map(|(_, data)| data.clone());
        let token = self.hub.alloc_token();
        self.hub.push_completion(self.id.get(), Completion::SnapshotGet { token, data });
        Ok(token)
    }
}

/// A trivial state machine: applies each payload by recording it (decoded as
/// UTF-8) so tests can assert on exactly what was applied and in what order.
#[derive(Default)]
pub struct VecFsm {
    pub applied: Vec<String>,
}

impl Fsm for VecFsm {
    type Output = String;

    fn apply(&mut self, _index: u64, payload: &[u8]) -> little_raft_engine::Result<String> {
        let value = String::from_utf8_lossy(payload).to_string();
        self.applied.push(value.clone());
        Ok(value)
    }

    fn snapshot(&mut self) -> little_raft_engine::Result<Vec<Bytes>> {
        Ok(vec![Bytes::from(self.applied.join("\n"))])
    }

    fn restore(&mut self, payload: &[u8]) -> little_raft_engine::Result<()> {
        self.applied = if payload.is_empty() {
            Vec::new()
        } else {
            String::from_utf8_lossy(payload).split('\n').map(|s| s.to_string()).collect()
        };
        Ok(())
    }
}

pub fn id(n: u64) -> ServerId {
    NonZeroU64::new(n).unwrap()
}

pub fn voters_config(ids: &[u64]) -> Configuration {
    let mut config = Configuration::init();
    for &i in ids {
        config.add(i, format!("127.0.0.1:{}", 9000 + i), ConfigRole::Voter).unwrap();
    }
    config
}

type Engine = little_raft_engine::Raft<TestIo, VecFsm>;

fn drain_one_round(hub: &Rc<Hub>, engines: &mut HashMap<u64, Engine>) -> bool {
    let mut did_work = false;

    let messages = hub.drain_messages();
    if !messages.is_empty() {
        did_work = true;
        let now = hub.now();
        for (to, from, message) in messages {
            if let Some(engine) = engines.get_mut(&to.get()) {
                let _ = engine.step(from, message, now);
            }
        }
    }

    for (&server, engine) in engines.iter_mut() {
        let completions = hub.drain_completions(server);
        if !completions.is_empty() {
            did_work = true;
            for completion in completions {
                let _ = engine.complete(completion);
            }
        }
    }

    did_work
}

/// Deliver every queued message and I/O completion, including whatever each
/// delivery itself produces, until the hub is quiescent or `max_rounds` is
/// hit (a safety bound — a correctly converging scenario settles in a few).
pub fn pump(hub: &Rc<Hub>, engines: &mut HashMap<u64, Engine>, max_rounds: usize) {
    for _ in 0..max_rounds {
        if !drain_one_round(hub, engines) {
            break;
        }
    }
}

/// Advance the virtual clock and call `tick` on every engine, then pump the
/// hub to quiescence.
pub fn tick_all(hub: &Rc<Hub>, engines: &mut HashMap<u64, Engine>, by: u64) {
    let now = hub.advance(by);
    for engine in engines.values_mut() {
        let _ = engine.tick(now);
    }
    pump(hub, engines, 16);
}

#[allow(dead_code)]
pub fn is_shutdown(err: &RaftError) -> bool {
    matches!(err, RaftError::Shutdown)
}
