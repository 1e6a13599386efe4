//! Batched export of flywheel records to a sink.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::processor::{FalsyBatchFilter, Processor, RecordToJsonProcessor, SpanToRecordProcessor};
use super::record::{ContractVersion, DfwEsRecord};
use super::registry::TraceAdapterRegistry;
use super::span::Span;
use crate::error::{NatError, Result};

const DEFAULT_ACCEPT: &str = "application/vnd.elasticsearch+json; compatible-with=8";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: f64,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default)]
    pub drop_on_overflow: bool,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval(),
            max_queue_size: default_max_queue_size(),
            drop_on_overflow: false,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> f64 {
    5.0
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_shutdown_timeout() -> f64 {
    10.0
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        // tokio intervals reject a zero period.
        secs(self.flush_interval_secs).max(Duration::from_millis(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        secs(self.shutdown_timeout_secs)
    }

    /// Rejects zero batch or queue sizes.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(NatError::Config("batch_size must be greater than 0".into()));
        }
        if self.max_queue_size == 0 {
            return Err(NatError::Config("max_queue_size must be greater than 0".into()));
        }
        Ok(())
    }
}

/// `[telemetry.data_flywheel]` settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DfwElasticsearchConfig {
    pub client_id: String,
    pub index: String,
    pub endpoint: String,
    #[serde(default)]
    pub contract_version: ContractVersion,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Replaces the default `Accept` header when set.
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub batch: BatchConfig,
}

/// Destination for batches of record documents.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn export_batch(&self, docs: Vec<Value>) -> Result<()>;
}

/// Newline-delimited bulk request body indexing every doc into `index`.
pub fn bulk_body(index: &str, docs: &[Value]) -> Result<String> {
    let action = serde_json::to_string(&serde_json::json!({"index": {"_index": index}}))?;
    let mut body = String::new();
    for doc in docs {
        body.push_str(&action);
        body.push('\n');
        body.push_str(&serde_json::to_string(doc)?);
        body.push('\n');
    }
    Ok(body)
}

pub struct ElasticsearchSink {
    http: reqwest::Client,
    endpoint: String,
    index: String,
    auth: Option<(String, String)>,
    headers: BTreeMap<String, String>,
}

impl ElasticsearchSink {
    pub fn new(endpoint: impl Into<String>, index: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| NatError::Export(format!("http client error: {err}")))?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            index: index.into(),
            auth: None,
            headers: BTreeMap::from([("Accept".to_string(), DEFAULT_ACCEPT.to_string())]),
        })
    }

    pub fn from_config(cfg: &DfwElasticsearchConfig) -> Result<Self> {
        let mut sink = Self::new(&cfg.endpoint, &cfg.index)?;
        // Credentials are only used as a pair.
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            sink = sink.with_basic_auth(user, pass);
        }
        if let Some(headers) = &cfg.headers {
            sink = sink.with_headers(headers.clone());
        }
        Ok(sink)
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn bulk_url(&self) -> String {
        format!("{}/_bulk", self.endpoint)
    }

    pub fn document_url(&self) -> String {
        format!("{}/{}/_doc", self.endpoint, self.index)
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(url);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some((user, pass)) = &self.auth {
            builder = builder.basic_auth(user, Some(pass));
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Value> {
        let resp = builder
            .send()
            .await
            .map_err(|err| NatError::Export(format!("elasticsearch request error: {err}")))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(NatError::Http {
                provider: "elasticsearch".into(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::Null))
    }

    /// Indexes a single document.
    pub async fn index_document(&self, doc: &Value) -> Result<()> {
        self.send(self.request(self.document_url()).json(doc)).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordSink for ElasticsearchSink {
    async fn export_batch(&self, docs: Vec<Value>) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let body = bulk_body(&self.index, &docs)?;
        let reply = self
            .send(
                self.request(self.bulk_url())
                    .header("Content-Type", "application/x-ndjson")
                    .body(body),
            )
            .await?;
        if reply.get("errors").and_then(Value::as_bool) == Some(true) {
            return Err(NatError::Export(format!(
                "bulk request to index '{}' reported item errors",
                self.index
            )));
        }
        debug!(count = docs.len(), index = %self.index, "exported bulk batch");
        Ok(())
    }
}

enum ExportCmd {
    Record(Value),
    Flush { ack: oneshot::Sender<()> },
    Shutdown { ack: oneshot::Sender<()> },
}

#[derive(Debug, Default)]
struct Counters {
    exported: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of exporter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub exported: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Converts spans to records and ships them to a [`RecordSink`] in batches
/// from a background task.
pub struct DfwExporter {
    to_record: SpanToRecordProcessor<DfwEsRecord>,
    to_json: RecordToJsonProcessor,
    tx: mpsc::Sender<ExportCmd>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    drop_on_overflow: bool,
    shutdown_timeout: Duration,
}

impl DfwExporter {
    /// Spawns the batching worker; must be called inside a tokio runtime.
    pub fn new(
        sink: Arc<dyn RecordSink>,
        registry: Arc<TraceAdapterRegistry>,
        client_id: impl Into<String>,
        version: ContractVersion,
        batch: &BatchConfig,
    ) -> Result<Self> {
        batch.validate()?;
        let (tx, rx) = mpsc::channel(batch.max_queue_size);
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(run_worker(
            rx,
            sink,
            batch.batch_size,
            batch.flush_interval(),
            counters.clone(),
        ));
        Ok(Self {
            to_record: SpanToRecordProcessor::new(registry, client_id),
            to_json: RecordToJsonProcessor::new(version),
            tx,
            worker: Mutex::new(Some(worker)),
            counters,
            drop_on_overflow: batch.drop_on_overflow,
            shutdown_timeout: batch.shutdown_timeout(),
        })
    }

    pub fn elasticsearch(cfg: &DfwElasticsearchConfig) -> Result<Self> {
        let sink = ElasticsearchSink::from_config(cfg)?;
        let exporter = Self::new(
            Arc::new(sink),
            Arc::new(TraceAdapterRegistry::with_defaults()),
            cfg.client_id.clone(),
            cfg.contract_version,
            &cfg.batch,
        )?;
        info!(endpoint = %cfg.endpoint, index = %cfg.index, version = cfg.contract_version.as_str(), "data flywheel exporter started");
        Ok(exporter)
    }

    pub fn stats(&self) -> ExportStats {
        ExportStats {
            exported: self.counters.exported.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Queues the record for `span`. Spans other than LLM starts are ignored.
    pub async fn export(&self, span: Span) -> Result<()> {
        let Some(record) = self.to_record.process(span).await? else {
            return Ok(());
        };
        let doc = self.to_json.process(Some(record)).await?;

        if self.drop_on_overflow {
            match self.tx.try_send(ExportCmd::Record(doc)) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("data flywheel queue full, dropping record");
                    Ok(())
                }
                Err(TrySendError::Closed(_)) => Err(closed()),
            }
        } else {
            self.tx
                .send(ExportCmd::Record(doc))
                .await
                .map_err(|_| closed())
        }
    }

    /// Sends everything queued so far to the sink.
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(ExportCmd::Flush { ack })
            .await
            .map_err(|_| closed())?;
        done.await.map_err(|_| closed())
    }

    /// Flushes pending records and stops the worker, waiting at most the
    /// configured shutdown timeout.
    pub async fn shutdown(&self) -> Result<()> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return Ok(());
        };

        let (ack, done) = oneshot::channel();
        let stopped = async {
            self.tx
                .send(ExportCmd::Shutdown { ack })
                .await
                .map_err(|_| closed())?;
            done.await.map_err(|_| closed())
        };
        match timeout(self.shutdown_timeout, stopped).await {
            Ok(result) => result,
            Err(_) => {
                worker.abort();
                Err(NatError::Export(format!(
                    "shutdown timed out after {:?}",
                    self.shutdown_timeout
                )))
            }
        }
    }
}

fn closed() -> NatError {
    NatError::Export("exporter is shut down".into())
}

async fn flush_batch(sink: &dyn RecordSink, batch: &mut Vec<Value>, counters: &Counters) {
    if batch.is_empty() {
        return;
    }
    let docs = std::mem::take(batch);
    let docs = match FalsyBatchFilter.process(docs).await {
        Ok(docs) if !docs.is_empty() => docs,
        _ => return,
    };
    let count = docs.len() as u64;
    match sink.export_batch(docs).await {
        Ok(()) => {
            counters.exported.fetch_add(count, Ordering::Relaxed);
        }
        Err(err) => {
            counters.failed.fetch_add(count, Ordering::Relaxed);
            error!(error = %err, count, "failed to export data flywheel batch");
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<ExportCmd>,
    sink: Arc<dyn RecordSink>,
    batch_size: usize,
    flush_interval: Duration,
    counters: Arc<Counters>,
) {
    let mut batch = Vec::with_capacity(batch_size);
    let mut ticker = interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(ExportCmd::Record(doc)) => {
                    batch.push(doc);
                    if batch.len() >= batch_size {
                        flush_batch(sink.as_ref(), &mut batch, &counters).await;
                    }
                }
                Some(ExportCmd::Flush { ack }) => {
                    flush_batch(sink.as_ref(), &mut batch, &counters).await;
                    let _ = ack.send(());
                }
                Some(ExportCmd::Shutdown { ack }) => {
                    rx.close();
                    let mut acks = vec![ack];
                    while let Ok(cmd) = rx.try_recv() {
                        match cmd {
                            ExportCmd::Record(doc) => batch.push(doc),
                            ExportCmd::Flush { ack } | ExportCmd::Shutdown { ack } => acks.push(ack),
                        }
                    }
                    flush_batch(sink.as_ref(), &mut batch, &counters).await;
                    for ack in acks {
                        let _ = ack.send(());
                    }
                    break;
                }
                None => {
                    flush_batch(sink.as_ref(), &mut batch, &counters).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                flush_batch(sink.as_ref(), &mut batch, &counters).await;
            }
        }
    }
    debug!("data flywheel worker stopped");
}
