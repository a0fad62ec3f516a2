/// storage.rs — append-only persistence sinks
///
/// The core writes through narrow traits (`BarSink`/`FeatureSink`/
/// `SignalSink`/`TradeSink`); the only implementation shipped is a
/// newline-delimited-JSON file sink satisfying all four via one generic
/// type, fire-and-forget behind an `mpsc` channel so a slow disk never sits
/// on the hot path.
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::error;

use crate::types::{Bar1m, Features1m, Signal, TradeRecord};

#[async_trait]
pub trait BarSink: Send + Sync {
    async fn write_bar(&self, bar: &Bar1m);
}

#[async_trait]
pub trait FeatureSink: Send + Sync {
    async fn write_features(&self, features: &Features1m);
}

#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn write_signal(&self, signal: &Signal);
}

#[async_trait]
pub trait TradeSink: Send + Sync {
    async fn write_trade(&self, trade: &TradeRecord);
}

/// Appends one JSON object per line to `path`. A background task owns the
/// file handle; callers hand records over a bounded channel and never block
/// on I/O themselves.
pub struct JsonlSink<T> {
    tx: mpsc::Sender<String>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Serialize + Send + 'static> JsonlSink<T> {
    pub fn spawn(path: PathBuf, channel_capacity: usize) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<String>(channel_capacity);

        tokio::spawn(async move {
            let file = OpenOptions::new().create(true).append(true).open(&path).await;
            let mut file = match file {
                Ok(f) => f,
                Err(e) => {
                    error!("failed to open sink file {}: {e}", path.display());
                    return;
                }
            };
            while let Some(line) = rx.recv().await {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    error!("sink write to {} failed: {e}", path.display());
                }
            }
        });

        Ok(Self { tx, _marker: std::marker::PhantomData })
    }

    fn enqueue(&self, record: &T) {
        let line = match serde_json::to_string(record) {
            Ok(mut s) => {
                s.push('\n');
                s
            }
            Err(e) => {
                error!("failed to serialize record for sink: {e}");
                return;
            }
        };
        // fire-and-forget: a full channel means the writer is behind, which
        // is a backpressure problem for the deployment to notice via the
        // channel's own metrics, not something the hot path should block on.
        if self.tx.try_send(line).is_err() {
            error!("sink channel full or closed, dropping record");
        }
    }
}

/// One concrete sink struct per stream, each a thin wrapper implementing
/// its corresponding trait over the shared generic writer above.
pub struct BarJsonlSink(JsonlSink<Bar1m>);
pub struct FeatureJsonlSink(JsonlSink<Features1m>);
pub struct SignalJsonlSink(JsonlSink<Signal>);
pub struct TradeJsonlSink(JsonlSink<TradeRecord>);

impl BarJsonlSink {
    pub fn spawn(path: PathBuf) -> Result<Self> {
        Ok(Self(JsonlSink::spawn(path, 1_024).context("spawning bar sink")?))
    }
}

impl FeatureJsonlSink {
    pub fn spawn(path: PathBuf) -> Result<Self> {
        Ok(Self(JsonlSink::spawn(path, 1_024).context("spawning feature sink")?))
    }
}

impl SignalJsonlSink {
    pub fn spawn(path: PathBuf) -> Result<Self> {
        Ok(Self(JsonlSink::spawn(path, 256).context("spawning signal sink")?))
    }
}

impl TradeJsonlSink {
    pub fn spawn(path: PathBuf) -> Result<Self> {
        Ok(Self(JsonlSink::spawn(path, 256).context("spawning trade sink")?))
    }
}

#[async_trait]
impl BarSink for BarJsonlSink {
    async fn write_bar(&self, bar: &Bar1m) {
        self.0.enqueue(bar);
    }
}

#[async_trait]
impl FeatureSink for FeatureJsonlSink {
    async fn write_features(&self, features: &Features1m) {
        self.0.enqueue(features);
    }
}

#[async_trait]
impl SignalSink for SignalJsonlSink {
    async fn write_signal(&self, signal: &Signal) {
        self.0.enqueue(signal);
    }
}

#[async_trait]
impl TradeSink for TradeJsonlSink {
    async fn write_trade(&self, trade: &TradeRecord) {
        self.0.enqueue(trade);
    }
}
