//! Interactive shell over a [`RemoteCache`].
//!
//! Lines typed by the user are parsed into a [`Command`] and run against the cache; keys and
//! values are taken as UTF-8 text.
//!
//! ```text
//! > put greeting hello
//! > get greeting
//! hello
//! > .exit
//! ```
use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::{HotRodResult, RemoteCache};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("failed to read command: {0}")]
    Io(#[from] io::Error),
}

/// Commands understood by the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get(String),
    Put(String, String),
    PutIfAbsent(String, String),
    Replace(String, String),
    Remove(String),
    Contains(String),
    /// Value and version of a key.
    Version(String),
    Stats,
    Clear,
    Ping,
    /// Leave the shell. `.exit`, or end of input.
    Exit,
}

fn arguments<const N: usize>(command: &str, args: &[&str]) -> Result<[String; N], CommandError> {
    let usage = match N {
        1 => format!("requires a key. Example: {command} greeting"),
        _ => format!("requires a key and a value. Example: {command} greeting hello"),
    };
    if args.len() != N {
        return Err(CommandError::InvalidCommandArguments {
            command: command.to_string(),
            reason: usage,
        });
    }
    Ok(std::array::from_fn(|i| args[i].to_string()))
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let line = line.trim();
        if line == ".exit" {
            return Ok(Command::Exit);
        }

        let parts = line.split_whitespace().collect::<Vec<&str>>();
        let Some((name, args)) = parts.split_first() else {
            return Err(CommandError::UnrecognizedCommand(String::new()));
        };

        match name.to_lowercase().as_str() {
            "get" => arguments::<1>(name, args).map(|[k]| Command::Get(k)),
            "remove" => arguments::<1>(name, args).map(|[k]| Command::Remove(k)),
            "contains" => arguments::<1>(name, args).map(|[k]| Command::Contains(k)),
            "version" => arguments::<1>(name, args).map(|[k]| Command::Version(k)),
            "put" => arguments::<2>(name, args).map(|[k, v]| Command::Put(k, v)),
            "putifabsent" => arguments::<2>(name, args).map(|[k, v]| Command::PutIfAbsent(k, v)),
            "replace" => arguments::<2>(name, args).map(|[k, v]| Command::Replace(k, v)),
            "stats" => Ok(Command::Stats),
            "clear" => Ok(Command::Clear),
            "ping" => Ok(Command::Ping),
            _ => Err(CommandError::UnrecognizedCommand(line.to_string())),
        }
    }
}

/// Prompts the user and parses one command. Blank lines prompt again.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, CommandError>
where
    R: BufRead,
    W: Write,
{
    let mut line = String::new();
    loop {
        write!(&mut writer, "> ")?;
        writer.flush()?;

        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(Command::Exit);
        }
        if !line.trim().is_empty() {
            return Command::try_from(line.as_str());
        }
    }
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Runs `command` against `cache`, returning what should be printed.
pub fn execute(cache: &RemoteCache, command: &Command) -> HotRodResult<Option<String>> {
    let output = match command {
        Command::Get(key) => Some(
            cache
                .get(key.as_bytes())?
                .map_or_else(|| "(nil)".to_string(), |v| text(&v)),
        ),
        Command::Put(key, value) => cache
            .put(key.as_bytes(), value.as_bytes())?
            .map(|previous| format!("previous: {}", text(&previous))),
        Command::PutIfAbsent(key, value) => {
            let outcome = cache.put_if_absent(key.as_bytes(), value.as_bytes())?;
            Some(if outcome.executed { "stored" } else { "exists" }.to_string())
        }
        Command::Replace(key, value) => {
            let outcome = cache.replace(key.as_bytes(), value.as_bytes())?;
            Some(if outcome.executed { "replaced" } else { "not found" }.to_string())
        }
        Command::Remove(key) => {
            let outcome = cache.remove(key.as_bytes())?;
            Some(if outcome.executed { "removed" } else { "not found" }.to_string())
        }
        Command::Contains(key) => Some(cache.contains_key(key.as_bytes())?.to_string()),
        Command::Version(key) => Some(match cache.get_versioned(key.as_bytes())? {
            Some(versioned) => format!("{} (version {})", text(&versioned.value), versioned.version),
            None => "(nil)".to_string(),
        }),
        Command::Stats => {
            let mut stats = cache.stats()?.into_iter().collect::<Vec<_>>();
            stats.sort();
            Some(
                stats
                    .into_iter()
                    .map(|(name, value)| format!("{name}: {value}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        }
        Command::Clear => {
            cache.clear()?;
            None
        }
        Command::Ping => {
            cache.ping()?;
            Some("pong".to_string())
        }
        Command::Exit => None,
    };
    Ok(output)
}
