use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest request line, terminator excluded.
pub const MAX_LINE_LEN: usize = 256;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// One request as read off the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    /// The line exceeded [`MAX_LINE_LEN`]; its bytes were discarded up to and
    /// including the next newline.
    Oversized,
}

/// Reads one request line with its terminator stripped. `None` means the
/// peer closed its side.
///
/// At most `MAX_LINE_LEN` bytes plus a CRLF are buffered per line. Bytes that
/// are not valid UTF-8 are replaced rather than failing the stream.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_LINE_LEN + 2;
    let mut line = Vec::with_capacity(128);
    let bytes = (&mut *reader)
        .take(limit as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if bytes == 0 {
        return Ok(None);
    }

    if line.last() != Some(&b'\n') && line.len() == limit {
        discard_rest_of_line(reader).await?;
        return Ok(Some(Frame::Oversized));
    }

    let decoded = String::from_utf8_lossy(&line);
    let trimmed = decoded.trim_end_matches(LINE_ENDINGS);
    if trimmed.len() > MAX_LINE_LEN {
        return Ok(Some(Frame::Oversized));
    }
    Ok(Some(Frame::Line(trimmed.to_string())))
}

async fn discard_rest_of_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|byte| *byte == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(());
            }
            None => {
                let skipped = available.len();
                reader.consume(skipped);
            }
        }
    }
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // One write per response so netcat-style clients see whole lines.
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
