//! Row sources and output sinks for the streaming engine

use crate::emitter::OutputRow;
use crate::event::{GroupKey, ResolvedRow};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// What a row source yields.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceItem {
    Row(ResolvedRow),
    /// No later row will carry an earlier timestamp than this
    Watermark(DateTime<Utc>),
    /// Tear down one partition; later rows with this key start fresh
    Retire(GroupKey),
}

impl From<ResolvedRow> for SourceItem {
    fn from(row: ResolvedRow) -> Self {
        SourceItem::Row(row)
    }
}

/// Upstream supplier of resolved rows.
///
/// Errors are returned to the caller of the engine untouched.
#[async_trait]
pub trait RowSource: Send {
    /// `Ok(None)` once the source is exhausted.
    async fn next(&mut self) -> Result<Option<SourceItem>>;
}

/// Source fed through a tokio channel; ends when every sender is dropped.
pub struct ChannelSource {
    name: String,
    receiver: mpsc::Receiver<SourceItem>,
}

impl ChannelSource {
    pub fn new(name: impl Into<String>, receiver: mpsc::Receiver<SourceItem>) -> Self {
        Self {
            name: name.into(),
            receiver,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl RowSource for ChannelSource {
    async fn next(&mut self) -> Result<Option<SourceItem>> {
        Ok(self.receiver.recv().await)
    }
}

/// Create a channel source and its sender.
pub fn channel(name: impl Into<String>, buffer: usize) -> (mpsc::Sender<SourceItem>, ChannelSource) {
    let (tx, rx) = mpsc::channel(buffer);
    (tx, ChannelSource::new(name, rx))
}

/// Source over an in-memory iterator.
pub struct IterSource<I> {
    items: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = SourceItem> + Send,
{
    pub fn new<T>(items: T) -> Self
    where
        T: IntoIterator<Item = SourceItem, IntoIter = I>,
    {
        Self {
            items: items.into_iter(),
        }
    }
}

impl IterSource<std::vec::IntoIter<SourceItem>> {
    pub fn from_rows(rows: Vec<ResolvedRow>) -> Self {
        Self::new(rows.into_iter().map(SourceItem::Row).collect::<Vec<_>>())
    }
}

#[async_trait]
impl<I> RowSource for IterSource<I>
where
    I: Iterator<Item = SourceItem> + Send,
{
    async fn next(&mut self) -> Result<Option<SourceItem>> {
        Ok(self.items.next())
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Downstream consumer of output rows.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Name of this sink
    fn name(&self) -> &str;

    /// Send one output row
    async fn send(&self, row: &OutputRow) -> Result<()>;

    /// Flush any buffered data
    async fn flush(&self) -> Result<()>;
}

/// Console sink - prints JSON lines to stdout
pub struct ConsoleSink {
    name: String,
    pretty: bool,
}

impl ConsoleSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pretty: false,
        }
    }

    pub fn pretty(mut self) -> Self {
        self.pretty = true;
        self
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, row: &OutputRow) -> Result<()> {
        if self.pretty {
            println!("{}", serde_json::to_string_pretty(row)?);
        } else {
            println!("{}", serde_json::to_string(row)?);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Forwards rows into a tokio channel.
pub struct ChannelSink {
    name: String,
    sender: mpsc::Sender<OutputRow>,
}

impl ChannelSink {
    pub fn new(name: impl Into<String>, sender: mpsc::Sender<OutputRow>) -> Self {
        Self {
            name: name.into(),
            sender,
        }
    }
}

#[async_trait]
impl Sink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, row: &OutputRow) -> Result<()> {
        self.sender
            .send(row.clone())
            .await
            .map_err(|_| anyhow::anyhow!("Sink '{}' receiver dropped", self.name))
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Keeps every row in memory; clones share the same buffer.
#[derive(Clone, Default)]
pub struct CollectingSink {
    rows: Arc<Mutex<Vec<OutputRow>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> Vec<OutputRow> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl Sink for CollectingSink {
    fn name(&self) -> &str {
        "collect"
    }

    async fn send(&self, row: &OutputRow) -> Result<()> {
        self.rows.lock().await.push(row.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
