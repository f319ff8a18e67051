use std::fmt;

/// A parsed REPL command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    /// Authorize as broadcaster with the given secret
    Secret(String),
    /// Authorize as listener with the given session key and join
    Key(String),
    /// Start broadcasting
    Start,
    /// Stop broadcasting or listening
    Stop,
    /// Mint a fresh session key
    Rotate,
    /// Print the current session state
    Status,
    /// Show available commands
    Help,
    /// Exit the application
    Quit,
}

impl fmt::Display for UserCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserCommand::Secret(secret) => write!(f, "/secret {}", secret),
            UserCommand::Key(key) => write!(f, "/key {}", key),
            UserCommand::Start => write!(f, "/start"),
            UserCommand::Stop => write!(f, "/stop"),
            UserCommand::Rotate => write!(f, "/rotate"),
            UserCommand::Status => write!(f, "/status"),
            UserCommand::Help => write!(f, "/help"),
            UserCommand::Quit => write!(f, "/quit"),
        }
    }
}

/// Command names and their descriptions, in help order
pub fn help_lines() -> Vec<(&'static str, &'static str)> {
    vec![
        ("/secret <secret>", "Authorize as broadcaster"),
        ("/key <key>", "Authorize as listener and join the session"),
        ("/start", "Start broadcasting"),
        ("/stop", "Stop broadcasting or listening"),
        ("/rotate", "Mint a fresh session key"),
        ("/status", "Show the current session state"),
        ("/help", "Show available commands"),
        ("/quit", "Exit"),
    ]
}

/// Parse a REPL input line into a command
pub fn parse(input: &str) -> Result<UserCommand, String> {
    let input = input.trim();

    if !input.starts_with('/') {
        return Err("Not a command (must start with /)".to_string());
    }

    let parts: Vec<&str> = input[1..].split_whitespace().collect();
    if parts.is_empty() {
        return Err("Empty command".to_string());
    }

    match parts[0] {
        "secret" => {
            if parts.len() < 2 {
                return Err("Missing secret (usage: /secret <secret>)".to_string());
            }
            Ok(UserCommand::Secret(parts[1].to_string()))
        }
        "key" => {
            if parts.len() < 2 {
                return Err("Missing session key (usage: /key <key>)".to_string());
            }
            Ok(UserCommand::Key(parts[1].to_string()))
        }
        "start" => Ok(UserCommand::Start),
        "stop" => Ok(UserCommand::Stop),
        "rotate" => Ok(UserCommand::Rotate),
        "status" => Ok(UserCommand::Status),
        "help" => Ok(UserCommand::Help),
        "quit" => Ok(UserCommand::Quit),
        other => Err(format!("Unknown command: /{}", other)),
    }
}
