//! Server accept loop and round bridging
//!
//! The [`Server`] accepts connections, turns each into a [`PlayerChannel`],
//! waits for the first registered player, then runs exactly one
//! [`SessionCoordinator`]. A fan-out task carries round output to players:
//! broadcasts go to a snapshot of the registered players taken per line,
//! direct replies go to the one player they name. Players that join while
//! the round is running receive every broadcast from then on and may guess.

use crate::catalog::Catalog;
use crate::error::ServerError;
use crate::player::{greet, PlayerChannel, PlayerRegistry, SharedRegistry};
use crate::session::{
    guess_queue, GuessIntake, GuessQueue, RoundMessage, RoundState, SessionCoordinator,
};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use shared::ServerLine;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How long player channels get to flush the final lines after a round
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Settings for one server process
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on, e.g. `127.0.0.1:5555`
    pub address: String,
    /// Directory holding one picture per file
    pub catalog_path: PathBuf,
    /// Time between two revealed lines
    pub tick: Duration,
    /// Connections beyond this are told the server is full
    pub max_players: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{}", shared::DEFAULT_PORT),
            catalog_path: PathBuf::from("images"),
            tick: Duration::from_millis(1000),
            max_players: 32,
        }
    }
}

/// Listener plus everything needed to run one round
///
/// Created with [`Server::bind`] and consumed by [`Server::run`]. The
/// cancellation token passed in is the root for the round and every player
/// connection, so cancelling it stops the whole server.
pub struct Server {
    listener: TcpListener,
    catalog: Arc<Catalog>,
    tick: Duration,
    registry: SharedRegistry,
    rng: StdRng,
    cancel: CancellationToken,
}

impl Server {
    /// Binds the listening socket. The catalog is loaded by the caller.
    ///
    /// The round's picture is drawn from `catalog` with `rng`, so a seeded
    /// rng gives a reproducible round. Fails with `ServerError::Bind` when
    /// the address cannot be bound.
    pub async fn bind(
        config: &ServerConfig,
        catalog: Arc<Catalog>,
        rng: StdRng,
        cancel: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.address)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.address.clone(),
                source,
            })?;
        info!("Server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            catalog,
            tick: config.tick,
            registry: PlayerRegistry::shared(config.max_players),
            rng,
            cancel,
        })
    }

    /// Address actually bound, useful when the config asked for port 0
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared handle to the connected players
    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    /// Accepts players and plays one round.
    ///
    /// Returns the finished round, or `None` if cancellation arrived before
    /// anyone registered.
    pub async fn run(self) -> Result<Option<RoundState>, ServerError> {
        let Server {
            listener,
            catalog,
            tick,
            registry,
            rng,
            cancel,
        } = self;

        let (intake, queue) = guess_queue();
        let (round_tx, round_rx) = mpsc::unbounded_channel();

        let mut round = tokio::spawn(run_round(
            Arc::clone(&registry),
            catalog,
            rng,
            queue,
            round_tx,
            tick,
            cancel.clone(),
        ));
        let fan_out = tokio::spawn(fan_out(Arc::clone(&registry), round_rx));
        let mut players = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                result = &mut round => {
                    break match result {
                        Ok(state) => state,
                        Err(e) => {
                            error!("Round task panicked: {}", e);
                            None
                        }
                    };
                },
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        admit(stream, addr, &registry, &intake, &cancel, &mut players).await;
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                Some(finished) = players.join_next(), if !players.is_empty() => {
                    if let Err(e) = finished {
                        warn!("Player task panicked: {}", e);
                    }
                },
            }
        };
        drop(listener);
        drop(intake);

        // The coordinator dropped its sender, so fan-out ends after the last line
        if let Err(e) = fan_out.await {
            warn!("Fan-out task panicked: {}", e);
        }

        registry.write().await.close_all();
        let flushed = tokio::time::timeout(FLUSH_TIMEOUT, async {
            while players.join_next().await.is_some() {}
        })
        .await;
        if flushed.is_err() {
            warn!("Player channels did not close in time, cancelling");
            cancel.cancel();
            players.shutdown().await;
        }

        match &outcome {
            Some(state) => info!(
                "Server finished: {:?}, answer was '{}'",
                state.status, state.picture.name
            ),
            None => info!("Server stopped before a round started"),
        }
        Ok(outcome)
    }
}

/// Registers a fresh connection and spawns its channel, or turns it away
async fn admit(
    mut stream: TcpStream,
    addr: SocketAddr,
    registry: &SharedRegistry,
    intake: &GuessIntake,
    cancel: &CancellationToken,
    players: &mut JoinSet<()>,
) {
    let admitted = {
        let mut registry = registry.write().await;
        registry.add_player(Some(addr), cancel).map(|admission| {
            let recipient = registry.recipient(admission.id);
            (admission, recipient)
        })
    };
    let Some((admission, recipient)) = admitted else {
        info!("Rejecting {}: server full", addr);
        tokio::spawn(async move {
            if let Err(e) = reject(&mut stream).await {
                debug!("Failed to notify {} of full server: {}", addr, e);
            }
        });
        return;
    };

    if let Some(recipient) = recipient {
        if let Err(e) = greet(&recipient) {
            warn!("Failed to greet player {}: {}", admission.id, e);
        }
    }

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }

    let channel = PlayerChannel::new(
        admission.id,
        Arc::clone(registry),
        intake.clone(),
        admission.cancel,
    );
    players.spawn(channel.run(stream, admission.outbox));
}

/// Tells a connection the server is full
async fn reject<W: AsyncWrite + Unpin>(writer: &mut W) -> std::io::Result<()> {
    let line = format!("{}\n", ServerLine::ServerFull);
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Waits for the first registered player, then plays the round
async fn run_round(
    registry: SharedRegistry,
    catalog: Arc<Catalog>,
    mut rng: StdRng,
    queue: GuessQueue,
    output: mpsc::UnboundedSender<RoundMessage>,
    tick: Duration,
    cancel: CancellationToken,
) -> Option<RoundState> {
    let mut registrations = registry.read().await.subscribe_registrations();
    while *registrations.borrow_and_update() == 0 {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            changed = registrations.changed() => {
                if changed.is_err() {
                    return None;
                }
            },
        }
    }

    let coordinator = SessionCoordinator::with_random_picture(&catalog, &mut rng, queue, output);
    info!(
        "Starting round with a {}-line picture",
        coordinator.picture().line_count()
    );
    Some(coordinator.start(tick, cancel.child_token()).await)
}

/// Delivers round output to players until the coordinator hangs up
async fn fan_out(registry: SharedRegistry, mut round_rx: mpsc::UnboundedReceiver<RoundMessage>) {
    while let Some(message) = round_rx.recv().await {
        match message {
            RoundMessage::Broadcast { line } => {
                let recipients = registry.read().await.registered_recipients();
                for recipient in recipients {
                    if let Err(e) = recipient.deliver(&line) {
                        warn!("Dropping player {}: {}", recipient.id, e);
                    }
                }
            }
            RoundMessage::Send { player_id, line } => {
                let recipient = registry.read().await.recipient(player_id);
                match recipient {
                    Some(recipient) => {
                        if let Err(e) = recipient.deliver(&line) {
                            warn!("Dropping player {}: {}", recipient.id, e);
                        }
                    }
                    None => debug!("Player {} left before its reply was sent", player_id),
                }
            }
        }
    }
}
