//! Parallel resolution of directory entries.
//!
//! Listing an encrypted directory yields opaque pointer files. Each of them has
//! to be read, decrypted and resolved into [`Metadata`], which takes a few
//! backend round trips per entry. The pipeline runs these jobs on a pool of
//! workers and collects the outcomes of a batch for the caller.
//!
//! Workers either consume an in-process channel or a Redis list, in which
//! case any process connected with the same identity may pick up the job.
//! Outcomes of Redis jobs are published on a pub/sub channel.

use {
    anyhow::{Context as _, Result, bail, format_err},
    async_trait::async_trait,
    cloakfs_protocol::Metadata,
    futures::StreamExt,
    parking_lot::Mutex,
    rand::distr::{Alphanumeric, SampleString},
    redis::{AsyncCommands, aio::MultiplexedConnection},
    serde::{Deserialize, Serialize},
    std::{
        collections::{HashMap, HashSet},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    },
    tokio::{
        sync::{self, mpsc},
        task::JoinHandle,
        time::sleep,
    },
    tracing::{debug, info, warn},
};

const BATCH_ID_LEN: usize = 16;
/// Max wait of a single blocking pop, in seconds.
const POP_TIMEOUT: f64 = 1.0;
const REDIS_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaJob {
    pub batch_id: String,
    pub job_id: usize,
    /// Backend key of the dirent directory holding the pointer file.
    pub dirent: String,
    /// Name of the pointer file, as returned by the backend listing.
    pub entry_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Resolved(Metadata),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub batch_id: String,
    pub job_id: usize,
    pub entry_name: String,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub entry_name: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct BatchResult {
    /// Sorted by name.
    pub resolved: Vec<Metadata>,
    pub failures: Vec<JobFailure>,
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &MetaJob) -> Result<Metadata>;
}

async fn run_job(handler: &dyn JobHandler, job: MetaJob) -> JobEvent {
    let outcome = match handler.handle(&job).await {
        Ok(metadata) => JobOutcome::Resolved(metadata),
        Err(err) => {
            warn!(?err, entry = %job.entry_name, "failed to resolve directory entry");
            JobOutcome::Failed(format!("{err:#}"))
        }
    };
    JobEvent {
        batch_id: job.batch_id,
        job_id: job.job_id,
        entry_name: job.entry_name,
        outcome,
    }
}

/// Routes job outcomes to the callers awaiting their batches.
#[derive(Default)]
struct BatchRegistry {
    batches: Mutex<HashMap<String, mpsc::UnboundedSender<JobEvent>>>,
}

impl BatchRegistry {
    fn register(&self, batch_id: &str, sender: mpsc::UnboundedSender<JobEvent>) {
        self.batches.lock().insert(batch_id.to_owned(), sender);
    }

    fn deregister(&self, batch_id: &str) {
        self.batches.lock().remove(batch_id);
    }

    fn deliver(&self, event: JobEvent) {
        let batches = self.batches.lock();
        match batches.get(&event.batch_id) {
            Some(sender) => {
                let _ = sender.send(event);
            }
            // Batch of another process or a finished batch.
            None => debug!(batch_id = %event.batch_id, "ignoring event of unknown batch"),
        }
    }

    fn clear(&self) {
        self.batches.lock().clear();
    }
}

enum Transport {
    Local(mpsc::UnboundedSender<MetaJob>),
    Redis {
        connection: MultiplexedConnection,
        jobs_key: String,
    },
}

pub struct Pipeline {
    registry: Arc<BatchRegistry>,
    transport: Transport,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Pipeline {
    /// Starts `workers` tasks consuming an in-process queue.
    #[must_use]
    #[inline]
    pub fn local(handler: Arc<dyn JobHandler>, workers: usize) -> Self {
        let registry = Arc::new(BatchRegistry::default());
        let (sender, receiver) = mpsc::unbounded_channel::<MetaJob>();
        let receiver = Arc::new(sync::Mutex::new(receiver));
        let tasks = (0..workers.max(1))
            .map(|_| {
                let receiver = Arc::clone(&receiver);
                let handler = Arc::clone(&handler);
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        registry.deliver(run_job(&*handler, job).await);
                    }
                })
            })
            .collect();
        debug!(workers, "started local metadata workers");
        Self {
            registry,
            transport: Transport::Local(sender),
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        }
    }

    /// Starts `workers` tasks consuming the Redis list `{prefix}_metaqueue:jobs`
    /// and a listener of the outcome channel `{prefix}_metaqueue:events`.
    #[inline]
    pub async fn distributed(
        handler: Arc<dyn JobHandler>,
        workers: usize,
        client: redis::Client,
        prefix: &str,
    ) -> Result<Self> {
        let registry = Arc::new(BatchRegistry::default());
        let jobs_key = format!("{prefix}_metaqueue:jobs");
        let events_channel = format!("{prefix}_metaqueue:events");
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to the job queue")?;

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&events_channel).await?;
        let mut tasks = Vec::new();
        let listener_registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                let event = message
                    .get_payload::<String>()
                    .map_err(anyhow::Error::from)
                    .and_then(|payload| Ok(serde_json::from_str::<JobEvent>(&payload)?));
                match event {
                    Ok(event) => listener_registry.deliver(event),
                    Err(err) => warn!(?err, "invalid job event"),
                }
            }
            debug!("job event listener stopped");
        }));

        for _ in 0..workers.max(1) {
            let mut connection = client.get_multiplexed_async_connection().await?;
            let handler = Arc::clone(&handler);
            let jobs_key = jobs_key.clone();
            let events_channel = events_channel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    if let Err(err) =
                        work_once(&mut connection, &*handler, &jobs_key, &events_channel).await
                    {
                        warn!(?err, "job queue worker error");
                        sleep(REDIS_RETRY_DELAY).await;
                    }
                }
            }));
        }
        info!(workers, %jobs_key, "started distributed metadata workers");
        Ok(Self {
            registry,
            transport: Transport::Redis {
                connection,
                jobs_key,
            },
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        })
    }

    async fn submit(&self, job: MetaJob) -> Result<()> {
        match &self.transport {
            Transport::Local(sender) => sender
                .send(job)
                .map_err(|_| format_err!("metadata workers have stopped")),
            Transport::Redis {
                connection,
                jobs_key,
            } => {
                let payload = serde_json::to_string(&job)?;
                let () = connection.clone().lpush(jobs_key, payload).await?;
                Ok(())
            }
        }
    }

    /// Resolves every entry of `dirent` and waits until all of them have
    /// either succeeded or failed.
    #[inline]
    pub async fn resolve_batch(&self, dirent: &str, entries: Vec<String>) -> Result<BatchResult> {
        let mut result = BatchResult::default();
        if self.stopped.load(Ordering::Acquire) {
            bail!("metadata pipeline was shut down");
        }
        if entries.is_empty() {
            return Ok(result);
        }
        let batch_id = Alphanumeric.sample_string(&mut rand::rng(), BATCH_ID_LEN);
        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.registry.register(&batch_id, sender);
        let registry = Arc::clone(&self.registry);
        let _deregister = scopeguard::guard(batch_id.clone(), move |id| registry.deregister(&id));

        let total = entries.len();
        for (job_id, entry_name) in entries.into_iter().enumerate() {
            self.submit(MetaJob {
                batch_id: batch_id.clone(),
                job_id,
                dirent: dirent.to_owned(),
                entry_name,
            })
            .await?;
        }

        let mut done = HashSet::new();
        while done.len() < total {
            let event = receiver
                .recv()
                .await
                .context("metadata pipeline was shut down")?;
            if !done.insert(event.job_id) {
                continue;
            }
            match event.outcome {
                JobOutcome::Resolved(metadata) => result.resolved.push(metadata),
                JobOutcome::Failed(reason) => result.failures.push(JobFailure {
                    entry_name: event.entry_name,
                    reason,
                }),
            }
        }
        result.resolved.sort_by(|a, b| a.name.cmp(&b.name));
        if !result.failures.is_empty() {
            warn!(
                %dirent,
                failed = result.failures.len(),
                total,
                "some directory entries could not be resolved"
            );
        }
        Ok(result)
    }

    /// Stops all workers. Pending batches fail.
    #[inline]
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.registry.clear();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn work_once(
    connection: &mut MultiplexedConnection,
    handler: &dyn JobHandler,
    jobs_key: &str,
    events_channel: &str,
) -> Result<()> {
    let popped: Option<(String, String)> = connection.brpop(jobs_key, POP_TIMEOUT).await?;
    let Some((_, payload)) = popped else {
        return Ok(());
    };
    let job: MetaJob = serde_json::from_str(&payload).context("invalid job in queue")?;
    let event = run_job(handler, job).await;
    let () = connection
        .publish(events_channel, serde_json::to_string(&event)?)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, clippy::indexing_slicing, reason = "test")]

    use {
        super::*,
        std::sync::atomic::AtomicUsize,
    };

    #[derive(Default)]
    struct TestHandler {
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for TestHandler {
        async fn handle(&self, job: &MetaJob) -> Result<Metadata> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if job.entry_name.starts_with("bad") {
                bail!("cannot decrypt {}", job.entry_name);
            }
            Ok(Metadata::file(format!("/{}", job.entry_name), 1))
        }
    }

    #[tokio::test]
    async fn resolves_batch_with_failures() {
        let handler = Arc::new(TestHandler::default());
        let pipeline = Pipeline::local(handler.clone(), 3);
        let entries = ["e", "bad1", "c", "a", "bad2", "d", "b"]
            .map(String::from)
            .to_vec();
        let result = pipeline.resolve_batch("dirent", entries).await.unwrap();
        let names: Vec<_> = result.resolved.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["/a", "/b", "/c", "/d", "/e"]);
        let mut failed: Vec<_> = result.failures.iter().map(|f| f.entry_name.as_str()).collect();
        failed.sort_unstable();
        assert_eq!(failed, ["bad1", "bad2"]);
        assert!(result.failures[0].reason.contains("cannot decrypt"));

        let max_active = handler.max_active.load(Ordering::SeqCst);
        assert!(max_active > 1);
        assert!(max_active <= 3);
    }

    #[tokio::test]
    async fn concurrent_batches_are_separated() {
        let pipeline = Arc::new(Pipeline::local(Arc::new(TestHandler::default()), 2));
        let p1 = Arc::clone(&pipeline);
        let p2 = Arc::clone(&pipeline);
        let (r1, r2) = tokio::join!(
            p1.resolve_batch("d1", vec!["x1".into(), "x2".into()]),
            p2.resolve_batch("d2", vec!["y1".into()]),
        );
        assert_eq!(r1.unwrap().resolved.len(), 2);
        assert_eq!(r2.unwrap().resolved[0].name, "/y1");
    }

    #[tokio::test]
    async fn empty_batch() {
        let pipeline = Pipeline::local(Arc::new(TestHandler::default()), 1);
        let result = pipeline.resolve_batch("dirent", Vec::new()).await.unwrap();
        assert!(result.resolved.is_empty());
        assert!(result.failures.is_empty());
    }

    #[tokio::test]
    async fn redis_queue_resolves_batches_across_pipelines() {
        let Some((host, port)) = crate::cache::test_redis_server().await else {
            debug!("redis is not available, skipping");
            return;
        };
        let client = redis::Client::open(format!("redis://{host}:{port}/")).unwrap();
        let prefix = format!(
            "_cloakfs_test_{}",
            Alphanumeric.sample_string(&mut rand::rng(), 12)
        );
        let first = Pipeline::distributed(Arc::new(TestHandler::default()), 2, client.clone(), &prefix)
            .await
            .unwrap();
        let second = Pipeline::distributed(Arc::new(TestHandler::default()), 1, client, &prefix)
            .await
            .unwrap();

        let (r1, r2) = tokio::join!(
            first.resolve_batch("d1", ["b", "bad1", "a"].map(String::from).to_vec()),
            second.resolve_batch("d2", vec!["c".into()]),
        );
        let r1 = r1.unwrap();
        let names: Vec<_> = r1.resolved.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["/a", "/b"]);
        assert_eq!(r1.failures.len(), 1);
        assert_eq!(r1.failures[0].entry_name, "bad1");
        assert_eq!(r2.unwrap().resolved[0].name, "/c");

        first.shutdown();
        second.shutdown();
        first
            .resolve_batch("d3", vec!["x".into()])
            .await
            .unwrap_err();
    }

    #[tokio::test]
    async fn fails_after_shutdown() {
        let pipeline = Pipeline::local(Arc::new(TestHandler::default()), 1);
        pipeline.shutdown();
        pipeline
            .resolve_batch("dirent", vec!["a".into()])
            .await
            .unwrap_err();
    }
}
