//! # Event Record Streams
//!
//! Line-delimited JSON record streams used by long-running watches.
//!
//! ## Record Format
//!
//! One JSON object per line, either the domain event's own fields or a
//! terminal error:
//!
//! ```text
//! {"key":"services/web","value":"up","index":4}
//! {"key":"services/db","value":"down","index":5}
//! {"Error":"watch index 3 compacted"}
//! ```
//!
//! The stream ends after the first error record or when the event source
//! closes cleanly.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared_types::BusError;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// A decoded record: a domain event or the terminal error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventRecord<E> {
    /// Terminal error; always the last record of a stream.
    Error {
        #[serde(rename = "Error")]
        error: String,
    },
    /// Domain event, serialized as its own fields.
    Event(E),
}

impl<E> EventRecord<E> {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Read half of a multiplexed record stream.
///
/// Dropping it stops the writer task even while both sources are quiet, which
/// in turn closes both source channels.
#[derive(Debug)]
pub struct EventStream {
    reader: DuplexStream,
    _writer: DropGuard,
}

impl AsyncRead for EventStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

/// Merge a domain event channel and an error channel into one record stream.
///
/// Returns the read half of a bounded in-memory pipe of `buffer` bytes. The
/// writer task suspends while the pipe is full, and stops draining `events`
/// until the consumer catches up.
///
/// Records keep the order they were received in. When an error is taken,
/// events already queued ahead of it are written first, then the error
/// record, and nothing after it.
///
/// The writer stops and closes the pipe when:
/// - either channel is closed
/// - an error record has been written
/// - the [`EventStream`] is dropped
pub fn multiplex_events<E>(
    events: mpsc::Receiver<E>,
    errors: mpsc::Receiver<String>,
    buffer: usize,
) -> EventStream
where
    E: Serialize + Send + 'static,
{
    let (writer, reader) = tokio::io::duplex(buffer.max(1));
    let shutdown = CancellationToken::new();
    tokio::spawn(write_records(events, errors, writer, shutdown.clone()));
    EventStream {
        reader,
        _writer: shutdown.drop_guard(),
    }
}

async fn write_records<E: Serialize>(
    mut events: mpsc::Receiver<E>,
    mut errors: mpsc::Receiver<String>,
    mut writer: DuplexStream,
    shutdown: CancellationToken,
) {
    let mut written: u64 = 0;
    loop {
        let error = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Event stream dropped by its reader");
                break;
            }
            error = errors.recv() => match error {
                Some(error) => error,
                None => break,
            },
            event = events.recv() => match event {
                Some(event) => {
                    if !write_line(&mut writer, encode(&event)).await {
                        break;
                    }
                    written += 1;
                    continue;
                }
                None => break,
            },
        };

        // Events that were queued before the error still go out ahead of it.
        let mut open = true;
        while let Ok(event) = events.try_recv() {
            open = write_line(&mut writer, encode(&event)).await;
            if !open {
                break;
            }
            written += 1;
        }
        let record = encode(&EventRecord::<E>::Error { error });
        if open && write_line(&mut writer, record).await {
            written += 1;
        }
        break;
    }

    let _ = writer.shutdown().await;
    debug!(records = written, "Event stream closed");
}

/// Write one encoded record; `false` once the stream should end.
async fn write_line(
    writer: &mut DuplexStream,
    record: Result<Vec<u8>, serde_json::Error>,
) -> bool {
    let line = match record {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "Dropping event stream: record not serializable");
            return false;
        }
    };
    match writer.write_all(&line).await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "Event stream consumer went away");
            false
        }
    }
}

fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

/// Consumer-side decoder for a record stream.
pub struct EventRecordReader<R> {
    lines: tokio::io::Lines<BufReader<R>>,
    finished: bool,
}

impl<R: AsyncRead + Unpin> EventRecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            finished: false,
        }
    }

    /// Read the next record; `None` once the stream has ended.
    ///
    /// After an error record has been returned no further lines are read.
    pub async fn next<E: DeserializeOwned>(&mut self) -> Result<Option<EventRecord<E>>, BusError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            let Some(line) = self.lines.next_line().await? else {
                self.finished = true;
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            let record: EventRecord<E> = serde_json::from_str(&line)?;
            self.finished = record.is_error();
            return Ok(Some(record));
        }
    }
}

/// Decode every record of a stream as a `Stream`.
pub fn decode_records<R, E>(reader: R) -> impl Stream<Item = Result<EventRecord<E>, BusError>>
where
    R: AsyncRead + Unpin,
    E: DeserializeOwned,
{
    LinesStream::new(BufReader::new(reader).lines())
        .filter(|line| !matches!(line, Ok(l) if l.trim().is_empty()))
        .map(|line| -> Result<EventRecord<E>, BusError> { Ok(serde_json::from_str(&line?)?) })
}
