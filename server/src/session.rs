//! Round coordination: the reveal clock raced against incoming guesses
//!
//! A [`SessionCoordinator`] owns one round. Its control loop is the only code
//! that touches [`RoundState`]; guesses arrive through a [`GuessIntake`] queue
//! and the reveal clock is a `tokio::time::Interval` polled by the same loop,
//! so a reveal and a guess are never evaluated against the state at the same
//! time. Output leaves the loop as [`RoundMessage`]s on an unbounded channel
//! that the lobby fans out to players.
//!
//! Guesses are evaluated in dequeue order. The first guess matching the
//! picture name (after trimming) wins; anything dequeued after the round has
//! left `Running` is ignored.

use crate::catalog::{Catalog, Picture};
use crate::player::PlayerId;
use log::{debug, info, warn};
use rand::Rng;
use shared::ServerLine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Lifecycle of a round
///
/// A round moves from `Pending` to `Running` when started and then into
/// exactly one of the three terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    /// Built but not started
    Pending,
    /// Revealing lines and accepting guesses
    Running,
    /// A player named the picture
    Won,
    /// Every line was revealed and nobody guessed it
    Exhausted,
    /// Stopped from outside; nothing was announced
    Cancelled,
}

impl RoundStatus {
    /// True for `Won`, `Exhausted` and `Cancelled`
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RoundStatus::Won | RoundStatus::Exhausted | RoundStatus::Cancelled
        )
    }
}

/// A candidate answer from a registered player
#[derive(Debug, Clone)]
pub struct Guess {
    pub player_id: PlayerId,
    /// Name announced if this guess wins
    pub display_name: String,
    /// Raw line as received; trimmed when evaluated
    pub text: String,
}

impl Guess {
    pub fn new(
        player_id: PlayerId,
        display_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            player_id,
            display_name: display_name.into(),
            text: text.into(),
        }
    }
}

/// How the control loop judged one guess
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuessOutcome {
    Correct,
    Wrong,
    /// Blank, late, or submitted after the round stopped
    Ignored,
}

/// Output of the control loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundMessage {
    /// Deliver to every registered player
    Broadcast { line: String },
    /// Deliver to one player only
    Send { player_id: PlayerId, line: String },
}

#[derive(Debug)]
struct GuessRequest {
    guess: Guess,
    reply: Option<oneshot::Sender<GuessOutcome>>,
}

/// One wake-up of the control loop
enum RoundEvent {
    Cancelled,
    Guess(GuessRequest),
    Tick,
}

/// Cloneable sending side of the guess queue
#[derive(Debug, Clone)]
pub struct GuessIntake {
    tx: mpsc::UnboundedSender<GuessRequest>,
}

/// Receiving side of the guess queue, consumed by the coordinator
#[derive(Debug)]
pub struct GuessQueue {
    rx: mpsc::UnboundedReceiver<GuessRequest>,
}

#[cfg(test)]
impl GuessQueue {
    pub(crate) fn drain_pending(&mut self) -> Vec<Guess> {
        let mut guesses = Vec::new();
        while let Ok(request) = self.rx.try_recv() {
            guesses.push(request.guess);
        }
        guesses
    }
}

/// Creates the queue that connects players to a (possibly not yet built) round
pub fn guess_queue() -> (GuessIntake, GuessQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (GuessIntake { tx }, GuessQueue { rx })
}

impl GuessIntake {
    /// Queues a guess without waiting for its evaluation.
    ///
    /// Returns false once the round's control loop has gone away.
    pub fn submit(&self, guess: Guess) -> bool {
        self.tx.send(GuessRequest { guess, reply: None }).is_ok()
    }

    /// Queues a guess and waits until the control loop has evaluated it
    pub async fn evaluate(&self, guess: Guess) -> GuessOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = GuessRequest {
            guess,
            reply: Some(reply_tx),
        };
        if self.tx.send(request).is_err() {
            return GuessOutcome::Ignored;
        }
        reply_rx.await.unwrap_or(GuessOutcome::Ignored)
    }
}

/// Everything the round produced, returned when it ends
#[derive(Debug, Clone)]
pub struct RoundState {
    /// Picture chosen for this round; its name is the answer
    pub picture: Arc<Picture>,
    /// Number of lines broadcast so far, never more than the picture has
    pub revealed: usize,
    pub status: RoundStatus,
    /// Every broadcast line in emission order (direct replies excluded)
    pub transcript: Vec<String>,
}

impl RoundState {
    fn new(picture: Arc<Picture>) -> Self {
        Self {
            picture,
            revealed: 0,
            status: RoundStatus::Pending,
            transcript: Vec::new(),
        }
    }

    /// Lines not yet revealed
    pub fn remaining(&self) -> usize {
        self.picture.line_count() - self.revealed
    }
}

/// Runs a single round
///
/// The coordinator owns the round state, the receiving end of the guess
/// queue and the output channel. It is built in `Pending` and consumed by
/// [`SessionCoordinator::start`], which returns the final [`RoundState`].
pub struct SessionCoordinator {
    state: RoundState,
    queue: GuessQueue,
    output: mpsc::UnboundedSender<RoundMessage>,
}

impl SessionCoordinator {
    /// Creates a pending round for `picture`
    ///
    /// Guesses are read from `queue`, which is fed by the matching
    /// [`GuessIntake`]. Broadcasts and direct replies go to `output`.
    pub fn new(
        picture: Arc<Picture>,
        queue: GuessQueue,
        output: mpsc::UnboundedSender<RoundMessage>,
    ) -> Self {
        Self {
            state: RoundState::new(picture),
            queue,
            output,
        }
    }

    /// Builds a coordinator for a picture chosen uniformly from `catalog`
    pub fn with_random_picture<R: Rng + ?Sized>(
        catalog: &Catalog,
        rng: &mut R,
        queue: GuessQueue,
        output: mpsc::UnboundedSender<RoundMessage>,
    ) -> Self {
        Self::new(catalog.pick(rng), queue, output)
    }

    /// Picture this round will reveal
    pub fn picture(&self) -> &Picture {
        &self.state.picture
    }

    /// Current status; `Pending` until started
    pub fn status(&self) -> RoundStatus {
        self.state.status
    }

    /// Runs the round to a terminal state and returns the final state.
    ///
    /// Takes `self` by value, so a coordinator can only be started once.
    pub async fn start(mut self, tick: Duration, cancel: CancellationToken) -> RoundState {
        self.state.status = RoundStatus::Running;
        info!(
            "Round started: {} lines, tick {:?}",
            self.state.picture.line_count(),
            tick
        );

        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first tick since it fires immediately
        ticker.tick().await;

        while self.state.status == RoundStatus::Running {
            let rx = &mut self.queue.rx;
            // Cancellation always wins; guesses and ticks race each other
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => RoundEvent::Cancelled,
                event = async {
                    tokio::select! {
                        Some(request) = rx.recv() => RoundEvent::Guess(request),
                        _ = ticker.tick() => RoundEvent::Tick,
                    }
                } => event,
            };

            match event {
                RoundEvent::Cancelled => {
                    self.state.status = RoundStatus::Cancelled;
                }
                RoundEvent::Guess(request) => {
                    let outcome = self.handle_guess(&request.guess);
                    if let Some(reply) = request.reply {
                        let _ = reply.send(outcome);
                    }
                }
                RoundEvent::Tick => self.handle_tick(),
            }
        }

        self.drain_queue();
        info!(
            "Round finished: {:?} after {} of {} lines",
            self.state.status,
            self.state.revealed,
            self.state.picture.line_count()
        );
        self.state
    }

    fn handle_tick(&mut self) {
        if self.state.status != RoundStatus::Running {
            return;
        }

        if self.state.remaining() > 0 {
            let line = self.state.picture.lines[self.state.revealed].clone();
            self.state.revealed += 1;
            debug!(
                "Revealing line {}/{}",
                self.state.revealed,
                self.state.picture.line_count()
            );
            self.broadcast(ServerLine::Reveal(line));
        } else {
            self.state.status = RoundStatus::Exhausted;
            info!("Nobody guessed '{}'", self.state.picture.name);
            let answer = self.state.picture.name.clone();
            self.broadcast(ServerLine::NobodyWon { answer });
            self.broadcast(ServerLine::GameEnded);
        }
    }

    fn handle_guess(&mut self, guess: &Guess) -> GuessOutcome {
        if self.state.status != RoundStatus::Running {
            return GuessOutcome::Ignored;
        }

        let text = guess.text.trim();
        if text.is_empty() {
            return GuessOutcome::Ignored;
        }

        if text == self.state.picture.name {
            self.state.status = RoundStatus::Won;
            info!(
                "Player {} ({}) guessed '{}'",
                guess.player_id, guess.display_name, text
            );
            let answer = self.state.picture.name.clone();
            self.broadcast(ServerLine::Winner {
                player: guess.display_name.clone(),
                answer,
            });
            self.broadcast(ServerLine::GameEnded);
            GuessOutcome::Correct
        } else {
            debug!("Player {} guessed wrong: '{}'", guess.player_id, text);
            self.send_to(guess.player_id, ServerLine::WrongGuess(text.to_string()));
            GuessOutcome::Wrong
        }
    }

    /// Discards whatever was queued behind the terminal event
    fn drain_queue(&mut self) {
        self.queue.rx.close();
        let mut discarded = 0;
        while let Ok(request) = self.queue.rx.try_recv() {
            if let Some(reply) = request.reply {
                let _ = reply.send(GuessOutcome::Ignored);
            }
            discarded += 1;
        }
        if discarded > 0 {
            debug!("Discarded {} guesses queued after the round ended", discarded);
        }
    }

    fn broadcast(&mut self, line: ServerLine) {
        let line = line.to_string();
        self.state.transcript.push(line.clone());
        if self.output.send(RoundMessage::Broadcast { line }).is_err() {
            warn!("Round output channel closed, broadcast dropped");
        }
    }

    fn send_to(&mut self, player_id: PlayerId, line: ServerLine) {
        let message = RoundMessage::Send {
            player_id,
            line: line.to_string(),
        };
        if self.output.send(message).is_err() {
            warn!("Round output channel closed, reply to {} dropped", player_id);
        }
    }
}
