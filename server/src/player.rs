//! Connected players and the per-connection line pipe
//!
//! This module handles the server-side view of players, including:
//! - The player registry: capacity, registration and the broadcast snapshot
//! - [`PlayerChannel`]: one read task and one write task per connection
//!
//! A player joins the round once it has sent a non-blank first line, which
//! becomes its display name. Every later non-blank line is a guess.

use crate::error::ConnectionError;
use crate::session::{Guess, GuessIntake};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{ServerLine, MAX_LINE_LENGTH};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

/// Lines buffered per player before the player counts as a slow consumer
pub const OUTBOX_CAPACITY: usize = 64;

/// Unique player identifier assigned by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(pub u32);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Registry entry for one connection
#[derive(Debug)]
pub struct Player {
    pub id: PlayerId,
    /// Peer address; `None` for in-memory connections
    pub addr: Option<SocketAddr>,
    /// Empty until the first non-blank line; never changes afterwards
    pub display_name: Option<String>,
    outbox: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Player {
    /// True once the player has sent a display name
    pub fn is_registered(&self) -> bool {
        self.display_name.is_some()
    }
}

/// Delivery handle for one player, detached from the registry lock
#[derive(Debug, Clone)]
pub struct Recipient {
    pub id: PlayerId,
    outbox: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Recipient {
    /// Queues a line for the player's write loop.
    ///
    /// A full outbox disconnects the player; a closed one means it is
    /// already leaving.
    pub fn deliver(&self, line: &str) -> Result<(), ConnectionError> {
        match self.outbox.try_send(line.to_string()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.cancel.cancel();
                Err(ConnectionError::SlowConsumer)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
        }
    }
}

/// Everything a newly accepted connection needs to run its channel
#[derive(Debug)]
pub struct Admission {
    pub id: PlayerId,
    pub outbox: mpsc::Receiver<String>,
    pub cancel: CancellationToken,
}

/// Tracks every connected player
///
/// Mutated only on accept (insert), registration and disconnect (remove).
/// Broadcasts take a snapshot of [`Recipient`]s so no lock is held while
/// lines are delivered.
pub struct PlayerRegistry {
    /// Connected players indexed by id
    players: HashMap<PlayerId, Player>,
    /// Next id handed out by `add_player`
    next_player_id: u32,
    /// Maximum number of concurrent connections
    max_players: usize,
    /// Running total of registrations, used to start the round
    registrations: watch::Sender<u64>,
}

pub type SharedRegistry = Arc<RwLock<PlayerRegistry>>;

impl PlayerRegistry {
    /// Creates an empty registry holding at most `max_players` connections
    ///
    /// Player ids start from 1 and are never reused.
    pub fn new(max_players: usize) -> Self {
        let (registrations, _) = watch::channel(0);
        Self {
            players: HashMap::new(),
            next_player_id: 1,
            max_players,
            registrations,
        }
    }

    /// Creates an empty registry behind the lock shared by all tasks
    pub fn shared(max_players: usize) -> SharedRegistry {
        Arc::new(RwLock::new(Self::new(max_players)))
    }

    /// Adds a connection, returning `None` when at capacity.
    ///
    /// The player's cancellation token is a child of `parent`.
    pub fn add_player(
        &mut self,
        addr: Option<SocketAddr>,
        parent: &CancellationToken,
    ) -> Option<Admission> {
        if self.players.len() >= self.max_players {
            return None;
        }

        let id = PlayerId(self.next_player_id);
        self.next_player_id += 1;

        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let cancel = parent.child_token();
        let player = Player {
            id,
            addr,
            display_name: None,
            outbox: outbox_tx,
            cancel: cancel.clone(),
        };
        info!("Player {} connected from {:?}", id, addr);
        self.players.insert(id, player);

        Some(Admission {
            id,
            outbox: outbox_rx,
            cancel,
        })
    }

    /// Sets the display name once. Returns false if the player is unknown or
    /// already named.
    pub fn register(&mut self, id: PlayerId, name: &str) -> bool {
        let Some(player) = self.players.get_mut(&id) else {
            return false;
        };
        if player.is_registered() {
            return false;
        }

        player.display_name = Some(name.to_string());
        info!("Player {} registered as '{}'", id, name);
        self.registrations.send_modify(|count| *count += 1);
        true
    }

    /// Removes a player, freeing its slot. Returns false if it was unknown.
    ///
    /// Dropping the entry also drops the outbox sender, which lets the write
    /// loop finish once it has drained what is queued.
    pub fn remove_player(&mut self, id: PlayerId) -> bool {
        if let Some(player) = self.players.remove(&id) {
            info!("Player {} disconnected", player.id);
            true
        } else {
            false
        }
    }

    /// Removes every player, dropping their outboxes so write loops can flush
    /// what is queued and exit
    pub fn close_all(&mut self) {
        let count = self.players.len();
        self.players.clear();
        debug!("Closed {} player outboxes", count);
    }

    /// Looks up a connected player
    pub fn get(&self, id: PlayerId) -> Option<&Player> {
        self.players.get(&id)
    }

    /// Display name of a player, if it has registered
    pub fn display_name(&self, id: PlayerId) -> Option<&str> {
        self.players.get(&id)?.display_name.as_deref()
    }

    /// Delivery handle for one player, registered or not
    pub fn recipient(&self, id: PlayerId) -> Option<Recipient> {
        self.players.get(&id).map(|player| Recipient {
            id: player.id,
            outbox: player.outbox.clone(),
            cancel: player.cancel.clone(),
        })
    }

    /// Delivery handles for every registered player
    pub fn registered_recipients(&self) -> Vec<Recipient> {
        self.players
            .values()
            .filter(|player| player.is_registered())
            .map(|player| Recipient {
                id: player.id,
                outbox: player.outbox.clone(),
                cancel: player.cancel.clone(),
            })
            .collect()
    }

    /// Connected players that have a display name
    pub fn registered_count(&self) -> usize {
        self.players.values().filter(|p| p.is_registered()).count()
    }

    /// Watches how many registrations have ever happened. Never decreases,
    /// so a player that registers and leaves is still observed.
    pub fn subscribe_registrations(&self) -> watch::Receiver<u64> {
        self.registrations.subscribe()
    }

    /// Connected players, registered or not
    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

/// Duplex line pipe for one connection
///
/// Reads lines from the socket into registration and guesses; writes lines
/// from the outbox to the socket. Any I/O error ends both loops and removes
/// the player from the registry.
pub struct PlayerChannel {
    id: PlayerId,
    registry: SharedRegistry,
    intake: GuessIntake,
    cancel: CancellationToken,
    display_name: Option<String>,
}

impl PlayerChannel {
    /// Creates the channel for an admitted player
    ///
    /// `id` and `cancel` come from the player's [`Admission`]. The channel
    /// registers the player in `registry` and removes it on disconnect;
    /// guesses go to `intake`.
    pub fn new(
        id: PlayerId,
        registry: SharedRegistry,
        intake: GuessIntake,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            registry,
            intake,
            cancel,
            display_name: None,
        }
    }

    /// Runs until the connection closes, fails, or is cancelled.
    ///
    /// Both halves run inside this task, so aborting it also releases the
    /// write side of the connection. Whichever loop stops first cancels the
    /// other.
    pub async fn run<S>(mut self, stream: S, outbox: mpsc::Receiver<String>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let id = self.id;
        let write_cancel = self.cancel.clone();

        let write_side = async move {
            let sink = FramedWrite::new(writer, LinesCodec::new());
            if let Err(e) = write_loop(sink, outbox, write_cancel.clone()).await {
                warn!("Write to player {} failed: {}", id, e);
            }
            write_cancel.cancel();
        };

        let read_side = async {
            let lines = FramedRead::new(
                reader,
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            );
            if let Err(e) = self.read_loop(lines).await {
                warn!("Read from player {} failed: {}", id, e);
            }
            self.cancel.cancel();
        };

        tokio::join!(read_side, write_side);
        self.registry.write().await.remove_player(self.id);
    }

    async fn read_loop<R>(
        &mut self,
        mut lines: FramedRead<R, LinesCodec>,
    ) -> Result<(), ConnectionError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                next = lines.next() => match next {
                    Some(line) => line?,
                    None => {
                        debug!("Player {} closed the connection", self.id);
                        return Ok(());
                    }
                },
            };
            self.handle_line(&line).await;
        }
    }

    async fn handle_line(&mut self, line: &str) {
        let text = line.trim();
        if text.is_empty() {
            return;
        }

        match self.display_name.clone() {
            None => {
                if self.registry.write().await.register(self.id, text) {
                    self.display_name = Some(text.to_string());
                }
            }
            Some(name) => {
                let guess = Guess::new(self.id, name, line);
                if !self.intake.submit(guess) {
                    debug!("Round is over, dropping guess from player {}", self.id);
                }
            }
        }
    }
}

/// Writes queued lines until the outbox closes or the player is cancelled
async fn write_loop<W>(
    mut sink: FramedWrite<W, LinesCodec>,
    mut outbox: mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            line = outbox.recv() => match line {
                // A peer that stops reading must not block cancellation
                Some(line) => tokio::select! {
                    sent = sink.send(line) => sent?,
                    _ = cancel.cancelled() => return Ok(()),
                },
                // Registry let go of this player: everything queued is written
                None => return Ok(()),
            },
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

/// Queues the two greeting lines for a new connection
pub fn greet(recipient: &Recipient) -> Result<(), ConnectionError> {
    recipient.deliver(&ServerLine::Welcome.to_string())?;
    recipient.deliver(&ServerLine::NamePrompt.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::guess_queue;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    fn admit(registry: &mut PlayerRegistry) -> Admission {
        registry.add_player(None, &CancellationToken::new()).unwrap()
    }

    #[test]
    fn test_registry_capacity() {
        let mut registry = PlayerRegistry::new(2);
        let first = admit(&mut registry);
        let second = admit(&mut registry);

        assert_eq!(first.id, PlayerId(1));
        assert_eq!(second.id, PlayerId(2));
        assert!(registry.add_player(None, &CancellationToken::new()).is_none());

        assert!(registry.remove_player(first.id));
        assert!(!registry.remove_player(first.id));
        assert_eq!(admit(&mut registry).id, PlayerId(3));
    }

    #[test]
    fn test_display_name_is_set_once() {
        let mut registry = PlayerRegistry::new(4);
        let player = admit(&mut registry);

        assert!(registry.register(player.id, "foo"));
        assert!(!registry.register(player.id, "bar"));
        assert_eq!(registry.display_name(player.id), Some("foo"));
        assert!(!registry.register(PlayerId(99), "ghost"));
    }

    #[test]
    fn test_only_registered_players_receive_broadcasts() {
        let mut registry = PlayerRegistry::new(4);
        let named = admit(&mut registry);
        let anonymous = admit(&mut registry);
        registry.register(named.id, "foo");

        let recipients = registry.registered_recipients();

        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].id, named.id);
        assert!(registry.recipient(anonymous.id).is_some());
        assert!(!registry.get(anonymous.id).unwrap().is_registered());
    }

    #[test]
    fn test_registrations_are_published() {
        let mut registry = PlayerRegistry::new(4);
        let watcher = registry.subscribe_registrations();
        let player = admit(&mut registry);
        assert_eq!(*watcher.borrow(), 0);

        registry.register(player.id, "foo");
        registry.register(player.id, "again");
        assert_eq!(*watcher.borrow(), 1);
        assert_eq!(registry.registered_count(), 1);

        registry.remove_player(player.id);
        assert_eq!(*watcher.borrow(), 1);
        assert_eq!(registry.registered_count(), 0);
    }

    #[test]
    fn test_full_outbox_cancels_player() {
        let mut registry = PlayerRegistry::new(1);
        let admission = admit(&mut registry);
        let recipient = registry.recipient(admission.id).unwrap();

        for _ in 0..OUTBOX_CAPACITY {
            assert_ok!(recipient.deliver("line"));
        }

        assert!(matches!(
            recipient.deliver("one too many"),
            Err(ConnectionError::SlowConsumer)
        ));
        assert!(admission.cancel.is_cancelled());
    }

    #[test]
    fn test_greet_queues_welcome_and_prompt() {
        let mut registry = PlayerRegistry::new(1);
        let mut admission = admit(&mut registry);

        assert_ok!(greet(&registry.recipient(admission.id).unwrap()));

        assert_eq!(admission.outbox.try_recv().unwrap(), "Welcome to Ascii drawing!");
        assert_eq!(admission.outbox.try_recv().unwrap(), "Please, enter your name:");
    }

    #[tokio::test]
    async fn test_first_line_registers_and_later_lines_are_guesses() {
        let registry = PlayerRegistry::shared(4);
        let admission = admit(&mut *registry.write().await);
        let (intake, mut queue) = guess_queue();
        let (mut remote, local) = duplex(1024);

        let channel = PlayerChannel::new(
            admission.id,
            registry.clone(),
            intake,
            admission.cancel.clone(),
        );
        let task = tokio::spawn(channel.run(local, admission.outbox));

        remote
            .write_all(b"\n   \n  foo  \ncamel\n\nbar\r\n")
            .await
            .unwrap();
        remote.shutdown().await.unwrap();
        drop(remote);

        assert_ok!(timeout(Duration::from_secs(5), task).await).unwrap();

        let guesses = queue.drain_pending();
        let texts: Vec<&str> = guesses.iter().map(|g| g.text.as_str()).collect();
        assert_eq!(texts, vec!["camel", "bar"]);
        assert!(guesses.iter().all(|g| g.display_name == "foo"));
        assert!(guesses.iter().all(|g| g.player_id == admission.id));

        // Disconnect removes the player
        assert!(registry.read().await.get(admission.id).is_none());
    }

    #[tokio::test]
    async fn test_outbox_lines_are_written_with_newlines() {
        let registry = PlayerRegistry::shared(4);
        let admission = admit(&mut *registry.write().await);
        let recipient = registry.read().await.recipient(admission.id).unwrap();
        let (intake, _queue) = guess_queue();
        let (remote, local) = duplex(1024);

        let channel = PlayerChannel::new(
            admission.id,
            registry.clone(),
            intake,
            admission.cancel.clone(),
        );
        let task = tokio::spawn(channel.run(local, admission.outbox));

        assert_ok!(greet(&recipient));
        assert_ok!(recipient.deliver("  /\\_/\\"));

        let mut lines = BufReader::new(remote).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "Welcome to Ascii drawing!");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "Please, enter your name:");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "  /\\_/\\");

        admission.cancel.cancel();
        assert_ok!(timeout(Duration::from_secs(5), task).await).unwrap();
    }

    #[tokio::test]
    async fn test_closing_registry_flushes_queued_lines() {
        let registry = PlayerRegistry::shared(4);
        let admission = admit(&mut *registry.write().await);
        let recipient = registry.read().await.recipient(admission.id).unwrap();
        let (intake, _queue) = guess_queue();
        let (remote, local) = duplex(1024);

        let channel = PlayerChannel::new(
            admission.id,
            registry.clone(),
            intake,
            admission.cancel.clone(),
        );
        let task = tokio::spawn(channel.run(local, admission.outbox));

        assert_ok!(recipient.deliver("Game ended!"));
        drop(recipient);
        registry.write().await.close_all();

        assert_ok!(timeout(Duration::from_secs(5), task).await).unwrap();

        let mut lines = BufReader::new(remote).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "Game ended!");
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stalled_peer_is_disconnected() {
        let registry = PlayerRegistry::shared(4);
        let admission = admit(&mut *registry.write().await);
        let recipient = registry.read().await.recipient(admission.id).unwrap();
        let (intake, _queue) = guess_queue();
        // Remote end is kept open but never read
        let (_remote, local) = duplex(16);

        let channel = PlayerChannel::new(
            admission.id,
            registry.clone(),
            intake,
            admission.cancel.clone(),
        );
        let task = tokio::spawn(channel.run(local, admission.outbox));

        let mut slow = false;
        for i in 0..OUTBOX_CAPACITY * 4 {
            if let Err(e) = recipient.deliver(&format!("line number {}", i)) {
                assert!(matches!(e, ConnectionError::SlowConsumer));
                slow = true;
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(slow);
        assert!(admission.cancel.is_cancelled());
        assert_ok!(timeout(Duration::from_secs(2), task).await).unwrap();
        assert!(registry.read().await.get(admission.id).is_none());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_blocked_write() {
        let registry = PlayerRegistry::shared(4);
        let admission = admit(&mut *registry.write().await);
        let recipient = registry.read().await.recipient(admission.id).unwrap();
        let (intake, _queue) = guess_queue();
        let (_remote, local) = duplex(16);

        let channel = PlayerChannel::new(
            admission.id,
            registry.clone(),
            intake,
            admission.cancel.clone(),
        );
        let task = tokio::spawn(channel.run(local, admission.outbox));

        assert_ok!(recipient.deliver("a line much longer than sixteen bytes"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        admission.cancel.cancel();

        assert_ok!(timeout(Duration::from_secs(2), task).await).unwrap();
        assert!(registry.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_overlong_line_disconnects() {
        let registry = PlayerRegistry::shared(4);
        let admission = admit(&mut *registry.write().await);
        let (intake, _queue) = guess_queue();
        let (mut remote, local) = duplex(MAX_LINE_LENGTH * 2);

        let channel = PlayerChannel::new(
            admission.id,
            registry.clone(),
            intake,
            admission.cancel.clone(),
        );
        let task = tokio::spawn(channel.run(local, admission.outbox));

        let junk = vec![b'x'; MAX_LINE_LENGTH + 10];
        remote.write_all(&junk).await.unwrap();

        assert_ok!(timeout(Duration::from_secs(5), task).await).unwrap();
        assert!(registry.read().await.is_empty());
    }
}
