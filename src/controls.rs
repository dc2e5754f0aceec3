//! Line-oriented control surface.
//!
//! The CLI host reads commands from stdin and forwards them to the loop.
//! The loop itself only ever sees the command channel, so other hosts can
//! drive it the same way.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::service::{Command, Mode};

pub const HELP: &str =
    "commands: scene | text | pause | resume | describe | voice <name> | rate <x> | voices | quit";

/// Parse one input line into a command.
pub fn parse(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    match parts.next()? {
        "scene" => Some(Command::SetMode(Mode::Scene)),
        "text" => Some(Command::SetMode(Mode::Text)),
        "pause" => Some(Command::Pause),
        "resume" => Some(Command::Resume),
        "describe" => Some(Command::DescribeNow),
        "voice" => parts.next().map(|n| Command::SetVoice(n.to_string())),
        "rate" => parts
            .next()
            .and_then(|r| r.parse().ok())
            .map(Command::SetRate),
        "voices" => Some(Command::RefreshVoices),
        "quit" | "exit" => Some(Command::Quit),
        _ => None,
    }
}

/// Read commands from stdin until EOF or quit.
pub async fn read_stdin(tx: mpsc::Sender<Command>) {
    info!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse(line) {
            Some(cmd) => {
                let quit = cmd == Command::Quit;
                if tx.send(cmd).await.is_err() || quit {
                    break;
                }
            }
            None => warn!("Unrecognized command '{line}' ({HELP})"),
        }
    }
}
