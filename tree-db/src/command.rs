//! Client request language and its execution against the store.
//!
//! A request is one line. Its first character selects the verb and the rest
//! of the line holds whitespace-separated arguments, so `qalice` and
//! `q alice` are the same query. Arguments beyond the ones a verb needs are
//! ignored.

use std::{
    fmt,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::{Insertion, Removal, StoreError, TreeStore};

/// Replay files may reference other replay files, up to this depth.
pub const MAX_REPLAY_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Query { name: String },
    Add { name: String, value: String },
    Delete { name: String },
    Replay { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown verb {0:?}")]
    UnknownVerb(char),
    #[error("missing {0}")]
    MissingArgument(&'static str),
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut chars = line.chars();
        let verb = chars.next().ok_or(ParseError::Empty)?;
        let mut args = chars.as_str().split_whitespace();

        match verb {
            'q' => Ok(Self::Query {
                name: next_arg(&mut args, "name")?,
            }),
            'a' => {
                let name = next_arg(&mut args, "name")?;
                let value = next_arg(&mut args, "value")?;
                Ok(Self::Add { name, value })
            }
            'd' => Ok(Self::Delete {
                name: next_arg(&mut args, "name")?,
            }),
            'f' => Ok(Self::Replay {
                path: PathBuf::from(next_arg(&mut args, "file name")?),
            }),
            other => Err(ParseError::UnknownVerb(other)),
        }
    }
}

fn next_arg<'a>(
    args: &mut impl Iterator<Item = &'a str>,
    what: &'static str,
) -> Result<String, ParseError> {
    args.next()
        .map(str::to_string)
        .ok_or(ParseError::MissingArgument(what))
}

/// What a client sees in reply to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Value(String),
    NotFound,
    Added,
    AlreadyPresent,
    EntryTooLong,
    Removed,
    NotInDatabase,
    FileProcessed,
    BadFileName,
    IllFormed,
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Response::Value(value) => value.as_str(),
            Response::NotFound => "not found",
            Response::Added => "added",
            Response::AlreadyPresent => "already in database",
            Response::EntryTooLong => "entry too long",
            Response::Removed => "removed",
            Response::NotInDatabase => "not in database",
            Response::FileProcessed => "file processed",
            Response::BadFileName => "bad file name",
            Response::IllFormed => "ill-formed command",
        };
        f.write_str(text)
    }
}

/// Parses and executes one request line from a connection task.
///
/// Replays read from the filesystem, so they run on the blocking pool. The
/// future is awaited to completion by the caller; cancellation of a replay
/// happens between its lines through `cancel`.
pub async fn dispatch(store: &Arc<TreeStore>, line: &str, cancel: &CancellationToken) -> Response {
    let command = match Command::parse(line) {
        Ok(command) => command,
        Err(err) => {
            debug!(error = %err, line, "ill-formed command");
            return Response::IllFormed;
        }
    };

    if !matches!(command, Command::Replay { .. }) {
        return execute(store, command, cancel);
    }

    let store = Arc::clone(store);
    let cancel = cancel.clone();
    match tokio::task::spawn_blocking(move || execute(&store, command, &cancel)).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = ?err, "file replay task failed");
            Response::BadFileName
        }
    }
}

/// Executes a parsed command synchronously.
pub fn execute(store: &TreeStore, command: Command, cancel: &CancellationToken) -> Response {
    execute_nested(store, command, cancel, 0)
}

fn execute_nested(
    store: &TreeStore,
    command: Command,
    cancel: &CancellationToken,
    depth: usize,
) -> Response {
    match command {
        Command::Query { name } => store.query(&name).map_or(Response::NotFound, Response::Value),
        Command::Add { name, value } => match store.insert(&name, &value) {
            Ok(Insertion::Inserted) => Response::Added,
            Ok(Insertion::AlreadyPresent) => Response::AlreadyPresent,
            Err(err @ StoreError::EntryTooLong { .. }) => {
                debug!(error = %err, "rejected insert");
                Response::EntryTooLong
            }
        },
        Command::Delete { name } => match store.remove(&name) {
            Removal::Removed => Response::Removed,
            Removal::NotFound => Response::NotInDatabase,
        },
        Command::Replay { path } if depth >= MAX_REPLAY_DEPTH => {
            debug!(path = %path.display(), depth, "replay nested too deeply");
            Response::IllFormed
        }
        Command::Replay { path } => replay_file(store, &path, cancel, depth + 1),
    }
}

/// Executes every line of `path` in order, discarding the per-line responses.
fn replay_file(store: &TreeStore, path: &Path, cancel: &CancellationToken, depth: usize) -> Response {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "cannot open replay file");
            return Response::BadFileName;
        }
    };

    let mut replayed = 0usize;
    for line in BufReader::new(file).lines() {
        if cancel.is_cancelled() {
            debug!(path = %path.display(), replayed, "replay cancelled");
            break;
        }
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "stopped reading replay file");
                break;
            }
        };
        let line = line.trim_end_matches('\r');
        match Command::parse(line) {
            Ok(command) => {
                execute_nested(store, command, cancel, depth);
            }
            Err(err) => debug!(error = %err, line, "ill-formed command in replay file"),
        }
        replayed += 1;
    }
    Response::FileProcessed
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn run(store: &TreeStore, line: &str) -> String {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(_) => return Response::IllFormed.to_string(),
        };
        execute(store, command, &CancellationToken::new()).to_string()
    }

    fn replay_file_with(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("create temp file");
        for line in lines {
            writeln!(file, "{line}").expect("write temp file");
        }
        file.flush().expect("flush temp file");
        file
    }

    #[test]
    fn parses_each_verb() {
        assert_eq!(
            Command::parse("qalice"),
            Ok(Command::Query {
                name: "alice".into()
            })
        );
        assert_eq!(
            Command::parse("a bob 25 extra"),
            Ok(Command::Add {
                name: "bob".into(),
                value: "25".into()
            })
        );
        assert_eq!(
            Command::parse("d\tcarol"),
            Ok(Command::Delete {
                name: "carol".into()
            })
        );
        assert_eq!(
            Command::parse("f /tmp/commands.txt"),
            Ok(Command::Replay {
                path: PathBuf::from("/tmp/commands.txt")
            })
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(Command::parse(""), Err(ParseError::Empty));
        assert_eq!(Command::parse("q"), Err(ParseError::MissingArgument("name")));
        assert_eq!(Command::parse("q   "), Err(ParseError::MissingArgument("name")));
        assert_eq!(
            Command::parse("abob"),
            Err(ParseError::MissingArgument("value"))
        );
        assert_eq!(Command::parse("xyz"), Err(ParseError::UnknownVerb('x')));
        assert_eq!(Command::parse("Qalice"), Err(ParseError::UnknownVerb('Q')));
    }

    #[test]
    fn responses_follow_store_outcomes() {
        let store = TreeStore::new();
        assert_eq!(run(&store, "aalice 30"), "added");
        assert_eq!(run(&store, "abob 25"), "added");
        assert_eq!(run(&store, "qalice"), "30");
        assert_eq!(run(&store, "aalice 99"), "already in database");
        assert_eq!(run(&store, "qalice"), "30");
        assert_eq!(run(&store, "dbob"), "removed");
        assert_eq!(run(&store, "qbob"), "not found");
        assert_eq!(run(&store, "dbob"), "not in database");
        assert_eq!(run(&store, "x"), "ill-formed command");
    }

    #[test]
    fn oversized_entries_do_not_reach_the_tree() {
        let store = TreeStore::new();
        let line = format!("a{} 1", "n".repeat(300));
        assert_eq!(run(&store, &line), "entry too long");
        assert!(store.entries().is_empty());
    }

    #[test]
    fn replay_applies_every_line_and_reports_once() {
        let store = TreeStore::new();
        let file = replay_file_with(&["aalice 30", "abob 25", "nonsense", "dalice", "acarol 40"]);
        let line = format!("f{}", file.path().display());

        assert_eq!(run(&store, &line), "file processed");
        assert_eq!(
            store.entries(),
            vec![
                ("bob".to_string(), "25".to_string()),
                ("carol".to_string(), "40".to_string())
            ]
        );
    }

    #[test]
    fn replay_of_missing_file_is_reported() {
        let store = TreeStore::new();
        let dir = tempfile::tempdir().expect("create temp dir");
        let line = format!("f{}", dir.path().join("missing.txt").display());
        assert_eq!(run(&store, &line), "bad file name");
    }

    #[test]
    fn replay_stops_when_cancelled() {
        let store = TreeStore::new();
        let file = replay_file_with(&["aalice 30", "abob 25"]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let response = execute(
            &store,
            Command::Replay {
                path: file.path().to_path_buf(),
            },
            &cancel,
        );
        assert_eq!(response, Response::FileProcessed);
        assert!(store.entries().is_empty());
    }

    #[test]
    fn self_referencing_replay_terminates() {
        let store = TreeStore::new();
        let mut file = NamedTempFile::new().expect("create temp file");
        let path = file.path().to_path_buf();
        writeln!(file, "aloop 1").expect("write temp file");
        writeln!(file, "f{}", path.display()).expect("write temp file");
        file.flush().expect("flush temp file");

        let line = format!("f{}", path.display());
        assert_eq!(run(&store, &line), "file processed");
        assert_eq!(store.query("loop").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn dispatch_runs_replays_off_the_runtime() {
        let store = Arc::new(TreeStore::new());
        let file = replay_file_with(&["aalice 30"]);
        let cancel = CancellationToken::new();

        let line = format!("f {}", file.path().display());
        assert_eq!(dispatch(&store, &line, &cancel).await, Response::FileProcessed);
        assert_eq!(
            dispatch(&store, "qalice", &cancel).await,
            Response::Value("30".into())
        );
        assert_eq!(dispatch(&store, "", &cancel).await, Response::IllFormed);
    }
}
