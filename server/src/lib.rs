//! # Ascii Drawing Game Server
//!
//! A line-oriented TCP game: one picture is revealed a line at a time and
//! players race to type its name. The first exact guess wins; if every line
//! has been shown and nobody guessed it, the round ends without a winner.
//!
//! ## Core Responsibilities
//!
//! ### Round Coordination
//! A single control loop owns the round state. The reveal clock and the
//! guesses of every player are serialized through it, so a reveal and a
//! winning guess can never be evaluated at the same time and at most one
//! player is ever declared winner.
//!
//! ### Player Management
//! Handles the lifecycle of player connections:
//! - Admission against a capacity limit and the two-line greeting
//! - Registration: the first non-blank line becomes the display name
//! - Forwarding later lines to the round as guesses
//! - Disconnect detection and cleanup
//!
//! ### Broadcasting
//! Round output is fanned out to a snapshot of the registered players taken
//! per line, so players can come and go while a round is running.
//!
//! ## Module Organization
//!
//! ### Catalog Module (`catalog`)
//! Loads pictures from a directory: one file per picture, file name as answer.
//!
//! ### Session Module (`session`)
//! The round state machine and its control loop.
//!
//! ### Player Module (`player`)
//! The player registry and the per-connection read/write tasks.
//!
//! ### Lobby Module (`lobby`)
//! The accept loop and the bridge between players and the round.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//! use server::catalog::Catalog;
//! use server::lobby::{Server, ServerConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let catalog = Arc::new(Catalog::load(&config.catalog_path)?);
//!
//!     let server = Server::bind(
//!         &config,
//!         catalog,
//!         StdRng::from_entropy(),
//!         CancellationToken::new(),
//!     )
//!     .await?;
//!
//!     // Plays one round and returns its final state
//!     let round = server.run().await?;
//!     println!("{:?}", round.map(|r| r.status));
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod error;
pub mod lobby;
pub mod player;
pub mod session;
