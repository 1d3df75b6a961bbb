//! Operator console read from the server's standard input.
//!
//! Only the first character of a line matters: `s` pauses every connection,
//! `g` releases them, and `p [file]` dumps the tree to stdout or to `file`.
//! End of input ends the console and the caller shuts the server down.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use crate::{server::ServerContext, store::TreeStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Pause,
    Resume,
    Dump { path: Option<PathBuf> },
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let mut chars = trimmed.chars();
        let Some(verb) = chars.next() else {
            bail!("empty console command");
        };

        match verb {
            's' => Ok(Self::Pause),
            'g' => Ok(Self::Resume),
            'p' => Ok(Self::Dump {
                path: chars.as_str().split_whitespace().next().map(PathBuf::from),
            }),
            _ => bail!("unknown console command '{trimmed}'. Try: s, g, p [file]"),
        }
    }
}

/// Runs console commands from `input` until it is exhausted.
pub async fn run<R>(input: R, ctx: &ServerContext) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("failed to read console input")?
    {
        if line.trim().is_empty() {
            continue;
        }
        match ConsoleCommand::parse(&line) {
            Ok(command) => execute(command, ctx).await,
            Err(err) => warn!("{err}"),
        }
    }
    info!("console closed");
    Ok(())
}

async fn execute(command: ConsoleCommand, ctx: &ServerContext) {
    match command {
        ConsoleCommand::Pause => ctx.gate.pause(),
        ConsoleCommand::Resume => ctx.gate.resume(),
        ConsoleCommand::Dump { path } => {
            if let Err(err) = dump(Arc::clone(&ctx.store), path).await {
                warn!(error = ?err, "failed to dump database");
            }
        }
    }
}

/// Writes the tree to `path`, or to stdout when no path is given. An existing
/// file is truncated.
pub async fn dump(store: Arc<TreeStore>, path: Option<PathBuf>) -> Result<()> {
    let written = tokio::task::spawn_blocking(move || -> Result<()> {
        match path {
            None => {
                let mut out = io::stdout().lock();
                store.dump(&mut out).context("failed to write dump to stdout")?;
                out.flush()?;
            }
            Some(path) => {
                let file = File::create(&path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                let mut out = BufWriter::new(file);
                store
                    .dump(&mut out)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                out.flush()?;
            }
        }
        Ok(())
    })
    .await
    .context("dump task failed")?;
    written
}
