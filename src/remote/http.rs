use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::cluster::Member;
use crate::config::RemoteConfig;
use crate::error::NetworkError;
use crate::telemetry::HealthMetrics;

use super::codec::encode_batch;
use super::{RemoteEnvelope, RemoteSender};

/// Path peers accept envelope batches on.
pub const ENVELOPES_PATH: &str = "/remote/v1/envelopes";

struct Outbound {
    target: Member,
    envelope: RemoteEnvelope,
}

/// HTTP transport with per-member batching.
///
/// `send` enqueues into a bounded channel and fails fast when it is full.
/// An accumulator task groups envelopes by target member and ships a batch
/// when it reaches `batch_size` or when `batch_timeout` elapses. At most
/// `max_in_flight` requests run at once; each gets a bounded number of
/// retries with exponential backoff, after which the batch is dropped.
pub struct HttpRemoteClient {
    tx: mpsc::Sender<Outbound>,
    max_queue_size: usize,
    telemetry: Option<Arc<HealthMetrics>>,
}

impl HttpRemoteClient {
    /// Starts the accumulator task. Cancelling `ctx` flushes pending
    /// batches and waits for in-flight requests.
    pub fn start(
        cfg: RemoteConfig,
        telemetry: Option<Arc<HealthMetrics>>,
        ctx: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>)> {
        if cfg.max_queue_size == 0 {
            bail!("remote max_queue_size must be positive");
        }
        if cfg.max_in_flight == 0 {
            bail!("remote max_in_flight must be positive");
        }

        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        let (tx, mut rx) = mpsc::channel::<Outbound>(cfg.max_queue_size);
        let cfg = Arc::new(cfg);
        let semaphore = Arc::new(Semaphore::new(cfg.max_in_flight));
        let task_telemetry = telemetry.clone();
        let max_queue_size = cfg.max_queue_size;

        tracing::info!(
            compression = %cfg.compression,
            max_in_flight = cfg.max_in_flight,
            batch_size = cfg.batch_size,
            "remote client started",
        );

        let handle = tokio::spawn(async move {
            let sender = BatchSender {
                client,
                cfg: Arc::clone(&cfg),
                semaphore,
                telemetry: task_telemetry,
            };
            let batch_size = cfg.batch_size.max(1);
            let mut pending: HashMap<Member, Vec<RemoteEnvelope>> = HashMap::new();
            let mut in_flight = JoinSet::new();
            let mut interval = tokio::time::interval(cfg.batch_timeout);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        while let Ok(item) = rx.try_recv() {
                            pending.entry(item.target).or_default().push(item.envelope);
                        }
                        sender.report_queue(0);
                        for (target, batch) in pending.drain() {
                            sender.spawn(&mut in_flight, target, batch).await;
                        }
                        break;
                    }

                    item = rx.recv() => {
                        let Some(item) = item else {
                            for (target, batch) in pending.drain() {
                                sender.spawn(&mut in_flight, target, batch).await;
                            }
                            break;
                        };

                        let batch = pending.entry(item.target.clone()).or_default();
                        batch.push(item.envelope);
                        if batch.len() >= batch_size {
                            let full = std::mem::replace(batch, Vec::with_capacity(batch_size));
                            sender.spawn(&mut in_flight, item.target, full).await;
                        }
                    }

                    _ = interval.tick() => {
                        for (target, batch) in pending.drain() {
                            sender.spawn(&mut in_flight, target, batch).await;
                        }
                    }

                    joined = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Some(Err(e)) = joined {
                            tracing::debug!(error = %e, "remote send task join failed");
                        }
                    }
                }
            }

            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    tracing::debug!(error = %e, "remote send task join failed");
                }
            }

            tracing::info!("remote client drained");
        });

        Ok((
            Self {
                tx,
                max_queue_size,
                telemetry,
            },
            handle,
        ))
    }
}

impl RemoteSender for HttpRemoteClient {
    fn send(&self, target: &Member, envelope: RemoteEnvelope) -> Result<(), NetworkError> {
        let result = self.tx.try_send(Outbound {
            target: target.clone(),
            envelope,
        });

        if let Some(t) = &self.telemetry {
            let queued = self.max_queue_size - self.tx.capacity().min(self.max_queue_size);
            t.remote_queue_length.set(queued as i64);
        }

        match result {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(NetworkError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(NetworkError::Closed),
        }
    }
}

struct BatchSender {
    client: reqwest::Client,
    cfg: Arc<RemoteConfig>,
    semaphore: Arc<Semaphore>,
    telemetry: Option<Arc<HealthMetrics>>,
}

impl BatchSender {
    fn report_queue(&self, queued: usize) {
        if let Some(t) = &self.telemetry {
            t.remote_queue_length.set(queued as i64);
        }
    }

    /// Waits for an in-flight slot, then ships the batch on its own task.
    /// While every slot is taken the accumulator stops draining the queue,
    /// so `send` sheds load instead of buffering without bound.
    async fn spawn(&self, in_flight: &mut JoinSet<()>, target: Member, batch: Vec<RemoteEnvelope>) {
        if batch.is_empty() {
            return;
        }

        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::warn!(error = %e, envelopes = batch.len(), "remote client semaphore closed");
                return;
            }
        };

        let client = self.client.clone();
        let cfg = Arc::clone(&self.cfg);
        let telemetry = self.telemetry.clone();

        in_flight.spawn(async move {
            let _permit = permit;

            if let Some(t) = &telemetry {
                t.remote_in_flight.inc();
            }

            let envelopes = batch.len();
            let result = send_with_retry(&client, &cfg, &target, &batch).await;

            if let Some(t) = &telemetry {
                t.remote_in_flight.dec();
            }

            if let Err(e) = result {
                if let Some(t) = &telemetry {
                    t.remote_failures.with_label_values(&[e.reason()]).inc();
                }
                tracing::warn!(
                    member = %target,
                    envelopes,
                    error = %e,
                    "remote batch dropped",
                );
            }
        });
    }
}

/// Posts one batch, retrying transient failures up to `max_retries` times.
async fn send_with_retry(
    client: &reqwest::Client,
    cfg: &RemoteConfig,
    target: &Member,
    batch: &[RemoteEnvelope],
) -> Result<(), NetworkError> {
    let body = encode_batch(batch, cfg.compression).map_err(|e| NetworkError::Rejected {
        member: target.to_string(),
        reason: format!("{e:#}"),
    })?;

    let mut attempt = 0u32;
    loop {
        match post(client, cfg, target, body.clone()).await {
            Ok(()) => {
                tracing::debug!(member = %target, envelopes = batch.len(), attempt, "sent remote batch");
                return Ok(());
            }
            Err(e) if attempt < cfg.max_retries && is_transient(&e) => {
                let backoff = cfg.retry_backoff * 2u32.saturating_pow(attempt);
                tracing::debug!(member = %target, attempt, error = %e, "retrying remote batch");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn post(
    client: &reqwest::Client,
    cfg: &RemoteConfig,
    target: &Member,
    body: Vec<u8>,
) -> Result<(), NetworkError> {
    let url = envelope_url(target);
    let mut request = client
        .post(&url)
        .header("Content-Type", "application/json")
        .body(body);

    if let Some(encoding) = cfg.compression.content_encoding() {
        request = request.header("Content-Encoding", encoding);
    }

    let resp = request.send().await.map_err(|e| classify(target, &e))?;
    let status = resp.status();
    // Drain body for connection reuse.
    let _ = resp.bytes().await;

    if !status.is_success() {
        return Err(NetworkError::Rejected {
            member: target.to_string(),
            reason: format!("unexpected status {status}"),
        });
    }

    Ok(())
}

fn envelope_url(target: &Member) -> String {
    let addr = target.as_str();
    if addr.starts_with("http://") || addr.starts_with("https://") {
        format!("{}{ENVELOPES_PATH}", addr.trim_end_matches('/'))
    } else {
        format!("http://{addr}{ENVELOPES_PATH}")
    }
}

fn classify(target: &Member, e: &reqwest::Error) -> NetworkError {
    if e.is_timeout() {
        NetworkError::Timeout(target.to_string())
    } else if e.is_connect() {
        NetworkError::Unreachable(target.to_string())
    } else {
        NetworkError::Rejected {
            member: target.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Timeouts, refused connections and 5xx answers are worth another try.
fn is_transient(e: &NetworkError) -> bool {
    match e {
        NetworkError::Timeout(_) | NetworkError::Unreachable(_) => true,
        NetworkError::Rejected { reason, .. } => reason.starts_with("unexpected status 5"),
        NetworkError::Backpressure | NetworkError::Closed => false,
    }
}
