use parley_types::QUICK_REACTIONS;
use thiserror::Error;
use uuid::Uuid;

/// One line of shell input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Reply { to: Uuid, text: String },
    Edit { id: Uuid, text: String },
    Delete(Uuid),
    Pin(Uuid),
    Unpin(Uuid),
    React { id: Uuid, emoji: String },
    Attach { mime: String, url: String, name: Option<String> },
    More,
    Search(String),
    Pinned,
    Typing,
    Away,
    Quit,
    Empty,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command /{0}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("not a message id: {0}")]
    BadId(String),
}

pub fn parse(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Send(line.to_string()));
    };

    let (name, args) = split_word(rest);
    match name {
        "reply" => {
            let (id, text) = id_and_text(args, "/reply <id> <text>")?;
            Ok(Command::Reply { to: id, text })
        }
        "edit" => {
            let (id, text) = id_and_text(args, "/edit <id> <text>")?;
            Ok(Command::Edit { id, text })
        }
        "delete" => Ok(Command::Delete(only_id(args, "/delete <id>")?)),
        "pin" => Ok(Command::Pin(only_id(args, "/pin <id>")?)),
        "unpin" => Ok(Command::Unpin(only_id(args, "/unpin <id>")?)),
        "react" => {
            let (id, emoji) = id_and_text(args, "/react <id> <emoji|1-4>")?;
            Ok(Command::React {
                id,
                emoji: quick_reaction(&emoji).map_or(emoji, str::to_string),
            })
        }
        "attach" => {
            const USAGE: &str = "/attach <mime> <url> [name]";
            let mut parts = args.split_whitespace();
            let (Some(mime), Some(url)) = (parts.next(), parts.next()) else {
                return Err(ParseError::Usage(USAGE));
            };
            let name = parts.collect::<Vec<_>>().join(" ");
            Ok(Command::Attach {
                mime: mime.to_string(),
                url: url.to_string(),
                name: (!name.is_empty()).then_some(name),
            })
        }
        "more" => Ok(Command::More),
        "search" => Ok(Command::Search(args.to_string())),
        "pinned" => Ok(Command::Pinned),
        "typing" => Ok(Command::Typing),
        "away" => Ok(Command::Away),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(ParseError::Unknown(other.to_string())),
    }
}

/// `1`..`4` pick from the quick-reaction bar.
fn quick_reaction(choice: &str) -> Option<&'static str> {
    let n: usize = choice.parse().ok()?;
    QUICK_REACTIONS.get(n.checked_sub(1)?).copied()
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, tail.trim()),
        None => (s, ""),
    }
}

fn parse_id(raw: &str) -> Result<Uuid, ParseError> {
    Uuid::parse_str(raw).map_err(|_| ParseError::BadId(raw.to_string()))
}

fn only_id(args: &str, usage: &'static str) -> Result<Uuid, ParseError> {
    let (id, extra) = split_word(args);
    if id.is_empty() || !extra.is_empty() {
        return Err(ParseError::Usage(usage));
    }
    parse_id(id)
}

fn id_and_text(args: &str, usage: &'static str) -> Result<(Uuid, String), ParseError> {
    let (id, text) = split_word(args);
    if id.is_empty() || text.is_empty() {
        return Err(ParseError::Usage(usage));
    }
    Ok((parse_id(id)?, text.to_string()))
}
