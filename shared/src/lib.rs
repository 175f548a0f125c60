use std::fmt;

pub const DEFAULT_PORT: u16 = 5555;
pub const MAX_LINE_LENGTH: usize = 4096;

pub const WELCOME: &str = "Welcome to Ascii drawing!";
pub const NAME_PROMPT: &str = "Please, enter your name:";
pub const GAME_ENDED: &str = "Game ended!";
pub const SERVER_FULL: &str = "Server is full.";

/// Every line the server can send to a player.
///
/// The wire form is the `Display` output followed by a single `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    Welcome,
    NamePrompt,
    Reveal(String),
    WrongGuess(String),
    Winner { player: String, answer: String },
    NobodyWon { answer: String },
    GameEnded,
    ServerFull,
}

impl fmt::Display for ServerLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerLine::Welcome => f.write_str(WELCOME),
            ServerLine::NamePrompt => f.write_str(NAME_PROMPT),
            ServerLine::Reveal(line) => f.write_str(line),
            ServerLine::WrongGuess(text) => write!(f, "Wrong guess: {}.", text),
            ServerLine::Winner { player, answer } => {
                write!(f, "Player {} is the winner! The correct guess: {}.", player, answer)
            }
            ServerLine::NobodyWon { answer } => write!(f, "Nobody won. It was {}.", answer),
            ServerLine::GameEnded => f.write_str(GAME_ENDED),
            ServerLine::ServerFull => f.write_str(SERVER_FULL),
        }
    }
}

impl From<ServerLine> for String {
    fn from(line: ServerLine) -> Self {
        line.to_string()
    }
}

/// Returns true for the line that closes every round.
pub fn is_final(line: &str) -> bool {
    line == GAME_ENDED
}
