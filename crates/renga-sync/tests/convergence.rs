//! Session-level replication scenarios over a simulated network that
//! duplicates, shuffles, and delays every delivery.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use renga_sync::{
    InboundReport, KvStore, MemoryStore, Outbound, SqliteStore, SyncConfig, SyncMessage,
    SyncSession, World,
    store::load_commands,
};
use renga_turn::{TurnEdit, TurnEvent};
use renga_types::{ActorId, Category, PeerId, PeerIdentity, Position, TurnPhase};
use serde_json::json;

#[derive(Clone)]
struct Delivery {
    to: usize,
    from: PeerId,
    raw: String,
}

struct Net {
    peers: Vec<SyncSession>,
    rng: StdRng,
    duplicate_rate: f64,
    delay_rate: f64,
    held: Vec<Delivery>,
}

impl Net {
    fn new(peers: Vec<SyncSession>, seed: u64) -> Self {
        Self {
            peers,
            rng: StdRng::seed_from_u64(seed),
            duplicate_rate: 0.3,
            delay_rate: 0.25,
            held: Vec::new(),
        }
    }

    fn index_of(&self, id: PeerId) -> Option<usize> {
        self.peers.iter().position(|p| p.identity().id == id)
    }

    /// Collect everything queued, then deliver it in a random order with
    /// random duplicates. Some deliveries are held back for a later round.
    fn step(&mut self) -> bool {
        let mut wire = std::mem::take(&mut self.held);
        for i in 0..self.peers.len() {
            let from = self.peers[i].identity().id;
            for outbound in self.peers[i].collect_outgoing() {
                match outbound {
                    Outbound::Broadcast(message) => {
                        let raw = message.encode().expect("encode");
                        for to in (0..self.peers.len()).filter(|&j| j != i) {
                            wire.push(Delivery {
                                to,
                                from,
                                raw: raw.clone(),
                            });
                        }
                    }
                    Outbound::SendTo { to, message } => {
                        let to = self.index_of(to).expect("known peer");
                        wire.push(Delivery {
                            to,
                            from,
                            raw: message.encode().expect("encode"),
                        });
                    }
                }
            }
        }
        if wire.is_empty() {
            return false;
        }

        let duplicate_rate = self.duplicate_rate;
        let copies: Vec<Delivery> = wire
            .iter()
            .filter(|_| self.rng.gen_bool(duplicate_rate))
            .cloned()
            .collect();
        wire.extend(copies);
        wire.shuffle(&mut self.rng);

        for delivery in wire {
            if self.rng.gen_bool(self.delay_rate) {
                self.held.push(delivery);
                continue;
            }
            self.peers[delivery.to].handle_envelope(delivery.from, &delivery.raw);
        }
        true
    }

    fn settle(&mut self) {
        // Held messages must all land eventually
        let delay_rate = self.delay_rate;
        for _ in 0..500 {
            if !self.step() {
                self.delay_rate = delay_rate;
                return;
            }
            self.delay_rate = (self.delay_rate - 0.01).max(0.0);
        }
        panic!("network did not settle");
    }
}

fn world(session: &SyncSession) -> World {
    serde_json::from_value(session.applier().snapshot()).expect("world snapshot")
}

fn assert_converged(peers: &[SyncSession]) {
    let reference = &peers[0];
    let reference_world = world(reference);
    for peer in &peers[1..] {
        assert_eq!(world(peer), reference_world, "world of {}", peer.identity().name);
        assert_eq!(
            peer.log().total_len(),
            reference.log().total_len(),
            "log of {}",
            peer.identity().name
        );
        assert_eq!(peer.parked_len(), 0);
    }

    let actors: Vec<ActorId> = peers
        .iter()
        .flat_map(|p| p.turns().actors().copied().collect::<Vec<_>>())
        .collect();
    for actor in actors {
        let expected = reference.turn(&actor).cloned().unwrap_or_default();
        for peer in &peers[1..] {
            let got = peer.turn(&actor).cloned().unwrap_or_default();
            assert!(got.same_content(&expected), "turn of {actor} on {}", peer.identity().name);
        }
    }
}

fn table(store: Arc<dyn KvStore>, players: usize) -> Vec<SyncSession> {
    let mut gm = SyncSession::new(SyncConfig::default(), PeerIdentity::authority("gm")).with_store(store);
    gm.bootstrap().expect("authority bootstrap");
    let mut peers = vec![gm];
    for i in 0..players {
        let mut peer = SyncSession::new(SyncConfig::default(), PeerIdentity::peer(format!("player-{i}")));
        peer.bootstrap().expect("peer bootstrap");
        peers.push(peer);
    }
    peers
}

/// Drop the resync requests every fresh peer queues on bootstrap.
fn drain(peers: &mut [SyncSession]) {
    for peer in peers {
        peer.collect_outgoing();
    }
}

/// One random local write that is valid on `session` right now.
fn random_write(session: &mut SyncSession, rng: &mut StdRng, round: usize) {
    let meters: Vec<String> = world(session).meters.keys().cloned().collect();
    let roll = rng.gen_range(0..4);
    if roll == 0 && session.identity().is_authority() {
        let segments = rng.gen_range(4..=8);
        session
            .submit(
                &Category::clocks(),
                "meter.create",
                json!({"meterId": format!("m{round}"), "label": "clock", "segments": segments}),
            )
            .expect("create meter");
    } else if roll == 1 && !meters.is_empty() {
        let meter = &meters[rng.gen_range(0..meters.len())];
        let ticks: i64 = rng.gen_range(-2..=3);
        session
            .submit(&Category::clocks(), "meter.advance", json!({"meterId": meter, "ticks": ticks}))
            .expect("advance meter");
    } else {
        let name = session.identity().name.clone();
        session
            .submit(&Category::journal(), "entry.add", json!({"text": format!("{name} r{round}")}))
            .expect("journal entry");
    }
}

#[test]
fn test_concurrent_writers_converge() {
    for seed in [1_u64, 7, 42] {
        let store = Arc::new(MemoryStore::new());
        let mut net = Net::new(table(store.clone(), 3), seed);
        let mut rng = StdRng::seed_from_u64(seed ^ 0xfeed);

        for round in 0..40 {
            for i in 0..net.peers.len() {
                if rng.gen_bool(0.6) {
                    random_write(&mut net.peers[i], &mut rng, round);
                }
            }
            net.step();
        }
        net.settle();

        assert_converged(&net.peers);
        assert!(net.peers[0].log().total_len() > 40);

        let gm = &mut net.peers[0];
        gm.persist_if_dirty().expect("persist");
        let stored: usize = load_commands(store.as_ref())
            .expect("load")
            .values()
            .map(Vec::len)
            .sum();
        assert_eq!(stored, gm.log().total_len());
    }
}

#[test]
fn test_out_of_order_dependency_recovers_via_resync() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let mut peers = table(store, 2);
    drain(&mut peers);
    let (gm_id, ana_id, bo_id) = (
        peers[0].identity().id,
        peers[1].identity().id,
        peers[2].identity().id,
    );

    peers[1]
        .submit(&Category::clocks(), "meter.create", json!({"meterId": "heat", "segments": 6}))
        .expect("create");
    let first = peers[1].collect_outgoing();
    peers[1]
        .submit(&Category::clocks(), "meter.advance", json!({"meterId": "heat", "ticks": 2}))
        .expect("advance");
    let second = peers[1].collect_outgoing();
    let raw = |out: &[Outbound]| match &out[0] {
        Outbound::Broadcast(message) => message.encode().expect("encode"),
        other => panic!("unexpected {other:?}"),
    };
    let (first, second) = (raw(&first), raw(&second));

    // gm sees both in order; bo only gets the advance
    peers[0].handle_envelope(ana_id, &first);
    peers[0].handle_envelope(ana_id, &second);
    let report = peers[2].handle_envelope(ana_id, &second);
    assert!(matches!(report, InboundReport::Batch(ref b) if b.failure.is_some()));
    assert_eq!(peers[2].parked_len(), 1);

    // bo asks, gm answers bo alone
    let ask = peers[2].collect_outgoing();
    let Outbound::Broadcast(request @ SyncMessage::ResyncRequest { .. }) = &ask[0] else {
        panic!("expected resync request, got {ask:?}");
    };
    let answered = peers[0].handle_message(bo_id, request.clone());
    assert!(matches!(answered, InboundReport::SnapshotSent { to, commands: 2 } if to == bo_id));
    let reply = peers[0].collect_outgoing();
    let Outbound::SendTo { to, message } = &reply[0] else {
        panic!("expected directed snapshot");
    };
    assert_eq!(*to, bo_id);

    let resynced = peers[2].handle_message(gm_id, message.clone());
    assert_eq!(resynced, InboundReport::Resynced { commands: 2 });
    assert_eq!(peers[2].parked_len(), 0);
    assert!(!peers[2].is_awaiting_snapshot());
    assert_eq!(world(&peers[2]).meter("heat").expect("meter").filled, 2);

    // The original create shows up late and is a duplicate
    let late = peers[2].handle_envelope(ana_id, &first);
    assert!(matches!(late, InboundReport::Batch(ref b) if b.deduplicated == 1 && b.applied == 0));
    assert_converged(&peers);
}

#[test]
fn test_authority_restart_replays_durable_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("table.db");

    let expected = {
        let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&path).expect("open"));
        let mut net = Net::new(table(store, 2), 3);
        let mut rng = StdRng::seed_from_u64(3);
        for round in 0..15 {
            for i in 0..net.peers.len() {
                random_write(&mut net.peers[i], &mut rng, round);
            }
            net.step();
        }
        net.settle();
        net.peers[0].persist_if_dirty().expect("persist");
        world(&net.peers[0])
    };

    let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&path).expect("reopen"));
    let mut gm = SyncSession::new(SyncConfig::default(), PeerIdentity::authority("gm")).with_store(store);
    gm.bootstrap().expect("bootstrap");
    assert_eq!(world(&gm), expected);
    assert!(gm.collect_outgoing().is_empty());
}

#[test]
fn test_late_joiner_catches_up() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let mut net = Net::new(table(store, 1), 11);
    let mut rng = StdRng::seed_from_u64(11);
    for round in 0..10 {
        for i in 0..net.peers.len() {
            random_write(&mut net.peers[i], &mut rng, round);
        }
        net.step();
    }
    net.settle();

    let mut late = SyncSession::new(SyncConfig::default(), PeerIdentity::peer("late"));
    late.bootstrap().expect("bootstrap");
    assert!(late.is_awaiting_snapshot());
    net.peers.push(late);
    net.settle();

    assert_converged(&net.peers);
    assert!(!net.peers[2].is_awaiting_snapshot());
}

#[test]
fn test_reset_wins_over_in_flight_turn() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let actor = ActorId::from_name("Vex");
    let mut net = Net::new(table(store, 1), 5);
    net.duplicate_rate = 0.5;
    net.delay_rate = 0.0;

    let player = &mut net.peers[1];
    player.turn_event(actor, TurnEvent::StartTurn).expect("start");
    player
        .turn_edit(actor, TurnEdit::Action(Some("skirmish".into())))
        .expect("action");
    player
        .turn_edit(actor, TurnEdit::Position(Some(Position::Risky)))
        .expect("position");
    net.settle();
    assert_eq!(net.peers[0].turn(&actor).map(|r| r.state), Some(TurnPhase::Deciding));

    assert_eq!(net.peers[0].full_reset(), 1);
    net.settle();

    let cleared = net.peers[1].turn(&actor).expect("record");
    assert!(cleared.is_reset());
    assert_converged(&net.peers);
}

#[test]
fn test_full_reset_beats_concurrent_player_edits() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let actor = ActorId::from_name("Vex");
    let mut net = Net::new(table(store, 1), 9);
    net.delay_rate = 0.0;

    let player = &mut net.peers[1];
    player.turn_event(actor, TurnEvent::StartTurn).expect("start");
    player
        .turn_edit(actor, TurnEdit::Action(Some("skirmish".into())))
        .expect("action");
    net.settle();

    // The player keeps editing, pushing the revision past the reset's,
    // before either side hears from the other
    assert_eq!(net.peers[0].full_reset(), 1);
    let player = &mut net.peers[1];
    player
        .turn_edit(actor, TurnEdit::Position(Some(Position::Risky)))
        .expect("position");
    player
        .turn_edit(actor, TurnEdit::Action(Some("prowl".into())))
        .expect("action");
    let reset_revision = net.peers[0].turn(&actor).expect("gm record").revision;
    assert!(net.peers[1].turn(&actor).expect("player record").revision > reset_revision);
    net.settle();

    for peer in &net.peers {
        assert!(peer.turn(&actor).expect("record").is_reset(), "{}", peer.identity().name);
    }
    assert_converged(&net.peers);
}

#[test]
fn test_stale_reset_does_not_wipe_newer_turn() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let actor = ActorId::from_name("Vex");
    let mut peers = table(store, 1);
    drain(&mut peers);
    let player_id = peers[1].identity().id;

    // An early, idle-looking record captured before the turn starts
    peers[1].turn_event(actor, TurnEvent::StartTurn).expect("start");
    peers[1].turn_event(actor, TurnEvent::Cancel).expect("cancel");
    let stale = peers[1].collect_outgoing();

    peers[1].turn_event(actor, TurnEvent::StartTurn).expect("restart");
    peers[1]
        .turn_edit(actor, TurnEdit::Action(Some("study".into())))
        .expect("action");
    let fresh = peers[1].collect_outgoing();

    let raw = |out: &[Outbound]| match &out[0] {
        Outbound::Broadcast(message) => message.encode().expect("encode"),
        other => panic!("unexpected {other:?}"),
    };
    peers[0].handle_envelope(player_id, &raw(&fresh));
    let report = peers[0].handle_envelope(player_id, &raw(&stale));
    assert!(matches!(report, InboundReport::Batch(ref b) if b.turns_stale == 1));
    assert_eq!(
        peers[0].turn(&actor).and_then(|r| r.action.clone()).as_deref(),
        Some("study")
    );
}

#[test]
fn test_suppressed_commands_go_out_after_reset() {
    let config = SyncConfig {
        breaker: renga_log::BreakerConfig {
            large_batch_threshold: 3,
            trip_after: 1,
        },
        ..Default::default()
    };
    let mut noisy = SyncSession::new(config, PeerIdentity::peer("noisy"));
    let mut quiet = SyncSession::new(SyncConfig::default(), PeerIdentity::peer("quiet"));
    let noisy_id = noisy.identity().id;
    let journal = Category::journal();

    let burst = |session: &mut SyncSession, n: usize| {
        for i in 0..n {
            session
                .submit(&journal, "entry.add", json!({"text": format!("spam {i}")}))
                .expect("append");
        }
        session.collect_outgoing()
    };

    // Trips on the first oversized batch, which is still delivered
    for out in burst(&mut noisy, 5) {
        let Outbound::Broadcast(message) = out else { continue };
        quiet.handle_message(noisy_id, message);
    }
    assert!(noisy.is_tripped());
    assert!(burst(&mut noisy, 1).is_empty());
    assert!(burst(&mut noisy, 1).is_empty());
    assert_eq!(quiet.log().total_len(), 5);

    noisy.reset_breaker();
    for out in burst(&mut noisy, 1) {
        let Outbound::Broadcast(message) = out else { continue };
        quiet.handle_message(noisy_id, message);
    }
    assert_eq!(noisy.log().total_len(), 8);
    assert_eq!(quiet.log().total_len(), 8);
    assert_eq!(world(&quiet), world(&noisy));
}
