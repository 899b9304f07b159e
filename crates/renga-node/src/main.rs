//! renga node binary.
//!
//! Runs one authority and a number of player peers in-process, connected
//! by the in-memory hub, and drives them with random play for a number of
//! rounds. Prints each peer's final snapshot as JSON.
//!
//! ```bash
//! renga-node --peers 4 --rounds 50 --duplicate-rate 0.2
//! renga-node --config table.ron --db table.db
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use renga_sync::{
    HubConfig, KvStore, MemoryHub, MemoryStore, PeerHandle, SessionSnapshot, SqliteStore,
    SyncConfig, SyncSession, Transport, World, spawn_peer,
};
use renga_turn::{TurnEdit, TurnEvent};
use renga_types::{ActorId, Category, Effect, PeerIdentity, Position, RollOutcome};
use serde_json::json;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Simulated renga table over an in-memory transport.
#[derive(Parser, Debug)]
#[command(name = "renga-node")]
#[command(about = "Run a local multi-peer renga table")]
struct Args {
    /// Session config (RON); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of player peers besides the authority
    #[arg(long, default_value_t = 3)]
    peers: usize,

    /// SQLite file for the authority's store; in-memory when omitted
    #[arg(long)]
    db: Option<PathBuf>,

    /// Rounds of random play
    #[arg(long, default_value_t = 20)]
    rounds: usize,

    /// Probability each delivery is duplicated
    #[arg(long, default_value_t = 0.1)]
    duplicate_rate: f64,

    /// Upper bound on random delivery delay
    #[arg(long, default_value_t = 25)]
    max_delay_ms: u64,

    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,
}

struct Player {
    handle: PeerHandle,
    actor: ActorId,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    #[cfg(feature = "telemetry")]
    let _otel_guard = if renga_telemetry::otel_enabled() {
        let (otel_layer, guard) = renga_telemetry::otel_layer("renga-node")?;
        registry.with(otel_layer).init();
        Some(guard)
    } else {
        registry.init();
        None
    };
    #[cfg(not(feature = "telemetry"))]
    registry.init();

    let args = Args::parse();
    if !(0.0..=1.0).contains(&args.duplicate_rate) {
        bail!("--duplicate-rate must be between 0 and 1");
    }
    let config = match &args.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SyncConfig::default(),
    };

    let store: Arc<dyn KvStore> = match &args.db {
        Some(path) => Arc::new(
            SqliteStore::open(path).with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };

    let hub = MemoryHub::new(HubConfig {
        duplicate_rate: args.duplicate_rate,
        max_delay_ms: args.max_delay_ms,
        seed: args.seed,
    });

    let gm = join(&hub, config.clone(), PeerIdentity::authority("gm"), Some(store))?;
    watch_breaker(&gm);

    let mut players = Vec::with_capacity(args.peers);
    for i in 0..args.peers {
        let actor = ActorId::from_name(&format!("actor-{i}"));
        let identity = PeerIdentity::peer(format!("player-{i}")).controlling(actor);
        let handle = join(&hub, config.clone(), identity, None)?;
        players.push(Player { handle, actor });
    }
    info!(players = players.len(), rounds = args.rounds, "table ready");

    let mut rng = StdRng::seed_from_u64(args.seed);
    for round in 0..args.rounds {
        play_round(&gm, &players, &mut rng, round).await?;
        tokio::time::sleep(Duration::from_millis(args.max_delay_ms / 2 + 1)).await;
    }

    let mut all = vec![gm.clone()];
    all.extend(players.iter().map(|p| p.handle.clone()));
    let snapshots = settle(&all, Duration::from_secs(10)).await?;

    gm.persist().await?;
    for snap in &snapshots {
        println!("{}", serde_json::to_string_pretty(snap)?);
    }
    for peer in &all {
        peer.shutdown().await?;
    }
    Ok(())
}

fn join(
    hub: &MemoryHub,
    config: SyncConfig,
    identity: PeerIdentity,
    store: Option<Arc<dyn KvStore>>,
) -> Result<PeerHandle> {
    let mut session = SyncSession::new(config, identity);
    if let Some(store) = store {
        session = session.with_store(store);
    }
    let replayed = session.bootstrap()?;
    debug!(peer = %session.identity().name, replayed, "bootstrapped");
    let inbox = hub.join(session.identity().id);
    let transport: Arc<dyn Transport> = Arc::new(hub.clone());
    Ok(spawn_peer(session, transport, inbox))
}

/// Log breaker trips and suppressed batches as they happen.
fn watch_breaker(peer: &PeerHandle) {
    let mut sub = peer.events().subscribe("breaker.*");
    tokio::spawn(async move {
        while let Some(msg) = sub.recv().await {
            warn!(subject = msg.subject, event = ?msg.event, "breaker event");
        }
    });
}

async fn play_round(
    gm: &PeerHandle,
    players: &[Player],
    rng: &mut StdRng,
    round: usize,
) -> Result<()> {
    if round % 5 == 0 {
        gm.submit(
            Category::clocks(),
            "meter.create",
            json!({"meterId": format!("clock-{round}"), "label": format!("Clock {round}"), "segments": rng.gen_range(4..=8)}),
        )
        .await?;
    }

    for player in players {
        match rng.gen_range(0..3) {
            0 => advance_known_meter(player, rng).await?,
            1 => {
                player
                    .handle
                    .submit(
                        Category::journal(),
                        "entry.add",
                        json!({"text": format!("round {round}"), "actorId": player.actor}),
                    )
                    .await?;
            }
            _ => take_turn(player, rng).await?,
        }
    }
    Ok(())
}

async fn advance_known_meter(player: &Player, rng: &mut StdRng) -> Result<()> {
    let snap = player.handle.snapshot().await?;
    let world: World = serde_json::from_value(snap.world)?;
    let meters: Vec<&String> = world.meters.keys().collect();
    if meters.is_empty() {
        return Ok(());
    }
    let meter = meters[rng.gen_range(0..meters.len())];
    player
        .handle
        .submit(
            Category::clocks(),
            "meter.advance",
            json!({"meterId": meter, "ticks": rng.gen_range(1..=2)}),
        )
        .await?;
    Ok(())
}

/// One full turn: plan, roll, then close on success or cancel otherwise.
async fn take_turn(player: &Player, rng: &mut StdRng) -> Result<()> {
    let (peer, actor) = (&player.handle, player.actor);
    peer.turn(actor, TurnEvent::StartTurn).await?;
    peer.edit(actor, TurnEdit::Action(Some("skirmish".into()))).await?;
    peer.edit(actor, TurnEdit::Position(Some(Position::Risky))).await?;
    peer.edit(actor, TurnEdit::Effect(Some(Effect::Standard))).await?;
    peer.turn(actor, TurnEvent::CommitRoll).await?;

    let pool = rng.gen_range(0..=3);
    let dice: Vec<u8> = (0..pool.max(2)).map(|_| rng.gen_range(1..=6)).collect();
    let roll = RollOutcome::from_dice(&dice, pool == 0);
    let favorable = roll.result.is_favorable();
    peer.turn(actor, TurnEvent::Rolled(roll)).await?;

    if favorable {
        peer.turn(actor, TurnEvent::Close).await?;
        peer.turn(actor, TurnEvent::Reset).await?;
    } else {
        peer.turn(actor, TurnEvent::Cancel).await?;
    }
    Ok(())
}

/// Wait until every peer holds the same number of commands with nothing parked.
async fn settle(peers: &[PeerHandle], limit: Duration) -> Result<Vec<SessionSnapshot>> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let mut snaps = Vec::with_capacity(peers.len());
        for peer in peers {
            snaps.push(peer.snapshot().await?);
        }
        let total = |s: &SessionSnapshot| s.log_lengths.values().sum::<usize>();
        let expected = total(&snaps[0]);
        if snaps.iter().all(|s| total(s) == expected && s.parked == 0) {
            info!(commands = expected, "peers converged");
            return Ok(snaps);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("peers did not converge within {limit:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
