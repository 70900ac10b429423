//! Coalesces concurrent "prepare this file for upload" requests into batched
//! control-plane calls.
//!
//! One worker thread drains the request queue. A batch opens with its first
//! request and keeps accepting requests until it is full, `batch_time` has
//! passed since it opened, the queue stays quiet for `inter_event_time`, or a
//! finish signal arrives. Each producer gets its answer on a private channel.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use artstore_domain::ArtifactError;

use crate::core::backend::{BackendApi, FileSpec};
use crate::core::config::BatchSettings;

/// A zero timeout would never wait at all; pulls always wait at least this.
const MIN_PULL_WAIT: Duration = Duration::from_nanos(1);

/// Control-plane answer for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareResponse {
    /// `None` when the control plane already has the content.
    pub upload_url: Option<String>,
    pub upload_headers: Vec<String>,
    pub birth_artifact_id: String,
}

type Reply = std::result::Result<PrepareResponse, ArtifactError>;

pub(crate) struct PrepareRequest {
    spec: FileSpec,
    reply: Sender<Reply>,
}

pub(crate) enum Event {
    Prepare(PrepareRequest),
    Finish,
}

/// Collect the next batch. Returns `(finished, batch)`; `finished` is set
/// when a finish signal (or a closed queue) ended the batch.
pub(crate) fn gather_batch(
    queue: &Receiver<Event>,
    batch_time: Duration,
    inter_event_time: Duration,
    max_batch_size: usize,
) -> (bool, Vec<PrepareRequest>) {
    let first = match queue.recv() {
        Ok(Event::Prepare(request)) => request,
        Ok(Event::Finish) | Err(_) => return (true, Vec::new()),
    };
    let opened = Instant::now();
    let mut batch = vec![first];

    while batch.len() < max_batch_size {
        let Some(remaining) = batch_time
            .checked_sub(opened.elapsed())
            .filter(|left| !left.is_zero())
        else {
            break;
        };
        let wait = inter_event_time.min(remaining).max(MIN_PULL_WAIT);
        match queue.recv_timeout(wait) {
            Ok(Event::Prepare(request)) => batch.push(request),
            Ok(Event::Finish) | Err(RecvTimeoutError::Disconnected) => return (true, batch),
            Err(RecvTimeoutError::Timeout) => break,
        }
    }
    (false, batch)
}

/// Background batcher in front of [`BackendApi::create_artifact_files`].
pub struct UploadBatcher {
    queue: Sender<Event>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UploadBatcher {
    /// Spawn the worker thread.
    pub fn start(api: Arc<dyn BackendApi>, settings: BatchSettings) -> Result<Self> {
        let (queue, requests) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("artstore-prepare".into())
            .spawn(move || run_worker(api.as_ref(), &requests, settings))
            .context("failed to spawn upload batcher thread")?;
        Ok(Self {
            queue,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue `spec` and return a handle for its answer.
    pub fn prepare_async(&self, spec: FileSpec) -> Result<PrepareHandle> {
        let (reply, answer) = mpsc::channel();
        let name = spec.name.clone();
        self.queue
            .send(Event::Prepare(PrepareRequest { spec, reply }))
            .map_err(|_| anyhow!("upload batcher has shut down; cannot prepare {name}"))?;
        Ok(PrepareHandle { name, answer })
    }

    /// Queue `spec` and block until its batch has been answered.
    pub fn prepare(&self, spec: FileSpec) -> Result<PrepareResponse> {
        self.prepare_async(spec)?.wait()
    }

    /// Ask the worker to flush what it has and stop.
    pub fn finish(&self) -> Result<()> {
        self.queue
            .send(Event::Finish)
            .map_err(|_| anyhow!("upload batcher has already shut down"))
    }

    pub fn is_alive(&self) -> bool {
        self.worker
            .lock()
            .map(|worker| worker.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Finish and wait for the worker to drain.
    pub fn shutdown(&self) -> Result<()> {
        let handle = self
            .worker
            .lock()
            .map_err(|_| anyhow!("upload batcher lock poisoned"))?
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };
        // The worker may already be gone if the queue closed.
        let _ = self.queue.send(Event::Finish);
        handle
            .join()
            .map_err(|_| anyhow!("upload batcher thread panicked"))
    }
}

impl Drop for UploadBatcher {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "upload batcher did not shut down cleanly");
        }
    }
}

/// Pending answer from [`UploadBatcher::prepare_async`].
pub struct PrepareHandle {
    name: String,
    answer: Receiver<Reply>,
}

impl PrepareHandle {
    pub fn wait(self) -> Result<PrepareResponse> {
        match self.answer.recv() {
            Ok(reply) => Ok(reply?),
            Err(_) => Err(anyhow!(
                "upload batcher stopped before answering for {}",
                self.name
            )),
        }
    }
}

fn run_worker(api: &dyn BackendApi, requests: &Receiver<Event>, settings: BatchSettings) {
    loop {
        let (finished, batch) = gather_batch(
            requests,
            settings.batch_time,
            settings.inter_event_time,
            settings.max_batch_size.max(1),
        );
        if !batch.is_empty() {
            dispatch(api, batch);
        }
        if finished {
            debug!("upload batcher finished");
            break;
        }
    }
}

fn dispatch(api: &dyn BackendApi, batch: Vec<PrepareRequest>) {
    let specs: Vec<FileSpec> = batch.iter().map(|request| request.spec.clone()).collect();
    debug!(files = specs.len(), "dispatching prepare batch");
    match api.create_artifact_files(&specs) {
        Ok(files) => {
            // Requests sharing a name share one answer.
            for request in batch {
                let reply = match files.get(&request.spec.name) {
                    Some(file) => Ok(PrepareResponse {
                        upload_url: file.upload_url.clone(),
                        upload_headers: file.upload_headers.clone(),
                        birth_artifact_id: file.artifact.id.clone(),
                    }),
                    None => Err(ArtifactError::BackendResponse {
                        detail: format!("no prepare result for {}", request.spec.name),
                    }),
                };
                // A producer that gave up waiting is not an error.
                let _ = request.reply.send(reply);
            }
        }
        Err(err) => {
            let shared = err
                .downcast_ref::<ArtifactError>()
                .cloned()
                .unwrap_or_else(|| ArtifactError::BackendUnavailable {
                    url: api.base_url().to_string(),
                    attempts: 1,
                    detail: format!("{err:#}"),
                });
            warn!(files = specs.len(), error = %shared, "prepare batch failed");
            for request in batch {
                let _ = request.reply.send(Err(shared.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::{ArtifactRef, CreatedFile, RemoteArtifact};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingApi {
        calls: AtomicUsize,
        largest_batch: AtomicUsize,
        fail: bool,
    }

    impl BackendApi for CountingApi {
        fn base_url(&self) -> &str {
            "http://control-plane.test"
        }

        fn api_key(&self) -> Option<&str> {
            None
        }

        fn create_artifact_files(
            &self,
            specs: &[FileSpec],
        ) -> Result<HashMap<String, CreatedFile>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.largest_batch.fetch_max(specs.len(), Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("control plane returned 500");
            }
            Ok(specs
                .iter()
                .map(|spec| {
                    (
                        spec.name.clone(),
                        CreatedFile {
                            upload_url: Some(format!("https://upload.test/{}", spec.name)),
                            upload_headers: vec!["Content-MD5:".to_string() + &spec.md5],
                            artifact: ArtifactRef {
                                id: "birth".into(),
                            },
                        },
                    )
                })
                .collect())
        }

        fn artifact_manifest(&self, artifact_id: &str) -> Result<RemoteArtifact> {
            anyhow::bail!("no artifact {artifact_id}")
        }
    }

    fn spec(name: &str) -> FileSpec {
        FileSpec {
            artifact_id: "art".into(),
            artifact_manifest_id: "man".into(),
            name: name.into(),
            md5: format!("md5-{name}"),
        }
    }

    fn request(name: &str) -> (Event, Receiver<Reply>) {
        let (reply, answer) = mpsc::channel();
        (
            Event::Prepare(PrepareRequest {
                spec: spec(name),
                reply,
            }),
            answer,
        )
    }

    fn names(batch: &[PrepareRequest]) -> Vec<&str> {
        batch.iter().map(|r| r.spec.name.as_str()).collect()
    }

    #[test]
    fn finish_first_ends_with_empty_batch() {
        let (tx, rx) = mpsc::channel();
        tx.send(Event::Finish).ok();
        let (finished, batch) =
            gather_batch(&rx, Duration::from_secs(1), Duration::from_millis(10), 10);
        assert!(finished);
        assert!(batch.is_empty());
    }

    #[test]
    fn finish_mid_batch_keeps_collected_requests() {
        let (tx, rx) = mpsc::channel();
        let mut answers = Vec::new();
        for name in ["a", "b"] {
            let (event, answer) = request(name);
            tx.send(event).ok();
            answers.push(answer);
        }
        tx.send(Event::Finish).ok();
        let (finished, batch) =
            gather_batch(&rx, Duration::from_secs(1), Duration::from_millis(200), 10);
        assert!(finished);
        assert_eq!(names(&batch), ["a", "b"]);
    }

    #[test]
    fn full_batches_stop_at_max_size() {
        let (tx, rx) = mpsc::channel();
        let mut answers = Vec::new();
        for i in 0..5 {
            let (event, answer) = request(&format!("f{i}"));
            tx.send(event).ok();
            answers.push(answer);
        }
        let (finished, batch) =
            gather_batch(&rx, Duration::from_secs(5), Duration::from_secs(5), 3);
        assert!(!finished);
        assert_eq!(names(&batch), ["f0", "f1", "f2"]);
        let (_, rest) = gather_batch(&rx, Duration::from_millis(50), Duration::from_millis(10), 3);
        assert_eq!(names(&rest), ["f3", "f4"]);
    }

    #[test]
    fn quiet_queue_closes_the_batch_early() {
        let (tx, rx) = mpsc::channel();
        let (event, _answer) = request("only");
        tx.send(event).ok();
        let started = Instant::now();
        let (finished, batch) =
            gather_batch(&rx, Duration::from_secs(30), Duration::from_millis(20), 10);
        assert!(!finished);
        assert_eq!(batch.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn batches_never_outlive_batch_time() {
        let (tx, rx) = mpsc::channel();
        let producer = thread::spawn(move || {
            let mut answers = Vec::new();
            for i in 0..40 {
                let (event, answer) = request(&format!("f{i}"));
                if tx.send(event).is_err() {
                    break;
                }
                answers.push(answer);
                thread::sleep(Duration::from_millis(10));
            }
            answers
        });
        let started = Instant::now();
        let (_, batch) = gather_batch(&rx, Duration::from_millis(100), Duration::from_millis(80), 1000);
        let elapsed = started.elapsed();
        assert!(!batch.is_empty());
        assert!(batch.len() < 40);
        assert!(elapsed < Duration::from_millis(400), "{elapsed:?}");
        drop(rx);
        let _ = producer.join();
    }

    #[test]
    fn concurrent_requests_share_backend_calls() -> Result<()> {
        let api = Arc::new(CountingApi::default());
        let batcher = UploadBatcher::start(
            api.clone(),
            BatchSettings {
                batch_time: Duration::from_secs(2),
                inter_event_time: Duration::from_millis(500),
                max_batch_size: 3,
            },
        )?;
        let handles = (0..10)
            .map(|i| batcher.prepare_async(spec(&format!("file-{i}"))))
            .collect::<Result<Vec<_>>>()?;
        for (i, handle) in handles.into_iter().enumerate() {
            let response = handle.wait()?;
            assert_eq!(
                response.upload_url.as_deref(),
                Some(format!("https://upload.test/file-{i}").as_str())
            );
            assert_eq!(response.birth_artifact_id, "birth");
            assert_eq!(response.upload_headers, [format!("Content-MD5:md5-file-{i}")]);
        }
        batcher.shutdown()?;
        let calls = api.calls.load(Ordering::SeqCst);
        assert!((1..=4).contains(&calls), "backend called {calls} times");
        assert!(api.largest_batch.load(Ordering::SeqCst) <= 3);
        Ok(())
    }

    #[test]
    fn same_name_requests_in_one_batch_share_the_answer() -> Result<()> {
        let api = Arc::new(CountingApi::default());
        let batcher = UploadBatcher::start(
            api.clone(),
            BatchSettings {
                batch_time: Duration::from_secs(2),
                inter_event_time: Duration::from_millis(500),
                max_batch_size: 2,
            },
        )?;
        let first = batcher.prepare_async(spec("model.pt"))?;
        let second = batcher.prepare_async(spec("model.pt"))?;
        let first = first.wait()?;
        let second = second.wait()?;
        assert_eq!(first, second);
        assert_eq!(second.upload_url.as_deref(), Some("https://upload.test/model.pt"));
        batcher.shutdown()?;
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn lone_request_is_dispatched_once_batch_time_elapses() -> Result<()> {
        let api = Arc::new(CountingApi::default());
        let batcher = UploadBatcher::start(
            api.clone(),
            BatchSettings {
                batch_time: Duration::from_millis(100),
                inter_event_time: Duration::from_secs(10),
                max_batch_size: 100,
            },
        )?;
        let started = Instant::now();
        let response = batcher.prepare(spec("alone"))?;
        let elapsed = started.elapsed();
        assert!(response.upload_url.is_some());
        assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn backend_failures_reach_every_waiter() -> Result<()> {
        let api = Arc::new(CountingApi {
            fail: true,
            ..CountingApi::default()
        });
        let batcher = UploadBatcher::start(
            api,
            BatchSettings {
                batch_time: Duration::from_millis(200),
                inter_event_time: Duration::from_millis(100),
                max_batch_size: 10,
            },
        )?;
        let first = batcher.prepare_async(spec("a"))?;
        let second = batcher.prepare_async(spec("b"))?;
        for handle in [first, second] {
            let err = handle.wait().unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ArtifactError>(),
                Some(ArtifactError::BackendUnavailable { .. })
            ));
        }
        Ok(())
    }

    #[test]
    fn finished_batcher_rejects_new_work() -> Result<()> {
        let batcher =
            UploadBatcher::start(Arc::new(CountingApi::default()), BatchSettings::default())?;
        assert!(batcher.is_alive() || batcher.shutdown().is_ok());
        batcher.shutdown()?;
        assert!(!batcher.is_alive());
        assert!(batcher.prepare(spec("late")).is_err());
        Ok(())
    }
}
