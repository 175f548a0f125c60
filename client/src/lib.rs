//! # Ascii Drawing Terminal Client
//!
//! A thin line pipe for the drawing game: lines typed by the user go to the
//! server, lines from the server are printed as they arrive. The first line
//! typed is the player's name, every later line is a guess.
//!
//! The client stops when the server sends `Game ended!` or closes the
//! connection.

pub mod network;

pub use network::Client;
