// Runs one generation job against the backend:
// listen, submit, wait for completion, read history, fetch images, save them.
// The transport is behind the Backend trait; comfy.rs has the real one.

use std::{fmt::Debug, path::PathBuf, pin::Pin, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::{pin_mut, select, stream::FusedStream, FutureExt, StreamExt};
use indexmap::IndexMap;
use log::{debug, info, trace, warn};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    characters::Character,
    error::StudioError,
    metadata,
    patcher::RANDOM_SEED,
    serializer,
    storage::ImageArchive,
    utils::trim_string,
    workflow::{NodeRoles, Role, Workflow},
};

pub type EventStream = Pin<Box<dyn Send + FusedStream<Item = Result<ServerEvent>>>>;

/// A websocket notification. Only a few types matter to us; the rest are ignored.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl ServerEvent {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to parse server event")
    }

    fn prompt_id(&self) -> Option<&str> {
        self.data.get("prompt_id").and_then(Value::as_str)
    }

    /// `executing` with a null node is the end of the job.
    pub fn completes(&self, prompt_id: &str) -> bool {
        self.kind == "executing"
            && self.prompt_id() == Some(prompt_id)
            && self.data.get("node").map_or(true, Value::is_null)
    }

    pub fn failure(&self, prompt_id: &str) -> Option<String> {
        if self.kind != "execution_error" || self.prompt_id() != Some(prompt_id) {
            return None;
        }
        let message = self
            .data
            .get("exception_message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        Some(message.trim().to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

/// One entry of `/history/{id}`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct HistoryEntry {
    /// Either `[number, id, graph, extra, outputs]` or the bare graph.
    #[serde(default)]
    pub prompt: Value,
    #[serde(default)]
    pub outputs: IndexMap<String, NodeOutput>,
}

impl HistoryEntry {
    /// The graph the backend actually ran.
    pub fn recorded_workflow(&self) -> Option<Workflow> {
        let graph = match &self.prompt {
            Value::Array(parts) => parts.get(2)?,
            graph @ Value::Object(_) => graph,
            _ => return None,
        };
        match serde_json::from_value(graph.clone()) {
            Ok(workflow) => Some(workflow),
            Err(e) => {
                warn!("Recorded graph doesn't parse: {}", e);
                None
            }
        }
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageRef> {
        self.outputs.values().flat_map(|output| output.images.iter())
    }
}

pub fn recorded_prompt(workflow: &Workflow, roles: &NodeRoles) -> Option<String> {
    let id = roles.find(workflow, Role::Prompt)?;
    workflow
        .input(id, "text")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// The seed node's value, unless it's the random marker.
pub fn recorded_seed(workflow: &Workflow, roles: &NodeRoles) -> Option<i64> {
    let id = roles.find(workflow, Role::Seed)?;
    let seed = workflow.input(id, "seed")?;
    let seed = seed.as_i64().or_else(|| seed.as_f64().map(|f| f as i64))?;
    (seed != RANDOM_SEED && seed >= 0).then_some(seed)
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Opens the notification stream for `client_id`.
    async fn listen(&self, client_id: &str) -> Result<EventStream>;
    /// Queues a workflow. Returns the backend's job id, if it gave one.
    async fn submit(&self, workflow: &Workflow, client_id: &str) -> Result<Option<String>>;
    async fn history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>>;
    async fn view(&self, image: &ImageRef) -> Result<Vec<u8>>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobState {
    Submitted,
    Running,
    Complete,
    TimedOut,
    Failed(String),
}

pub struct Job<'a> {
    pub user: &'a str,
    pub character: &'a Character,
    /// What we asked for. The recorded prompt wins if the history has one.
    pub prompt: &'a str,
    pub workflow: &'a Workflow,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobOutcome {
    pub prompt_id: String,
    pub prompt: String,
    /// The seed the backend used, when it's known.
    pub seed: Option<i64>,
    pub latest: PathBuf,
    pub archived: Vec<PathBuf>,
    pub failed_images: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn Backend>,
    archive: ImageArchive,
    timeout: Duration,
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("archive", &self.archive)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn Backend>, archive: ImageArchive, timeout: Duration) -> Self {
        Self {
            backend,
            archive,
            timeout,
        }
    }

    pub async fn run(&self, job: Job<'_>) -> Result<JobOutcome> {
        let client_id = Uuid::new_v4().to_string();
        // Listen first, or a fast job can finish before we're watching.
        let events = self
            .backend
            .listen(&client_id)
            .await
            .context("failed to open notification stream")?;

        let prompt_id = self
            .backend
            .submit(job.workflow, &client_id)
            .await
            .context("failed to submit workflow")?
            .ok_or(StudioError::NoJobId)?;
        info!("Submitted job {} for {} ({})", prompt_id, job.user, job.character.name);

        match self.wait(events, &prompt_id).await {
            JobState::TimedOut => bail!(StudioError::TimedOut {
                prompt_id,
                seconds: self.timeout.as_secs(),
            }),
            JobState::Failed(message) => bail!(StudioError::ExecutionFailed { prompt_id, message }),
            state => debug!("Job {} ended listening as {:?}", prompt_id, state),
        }

        let history = self
            .backend
            .history(&prompt_id)
            .await
            .context("failed to fetch history")?
            .ok_or_else(|| StudioError::NoHistory(prompt_id.clone()))?;
        self.persist(&job, prompt_id, &history).await
    }

    /// Consumes notifications until the job's fate is known, or the stream gives out.
    async fn wait(&self, mut events: EventStream, prompt_id: &str) -> JobState {
        let mut state = JobState::Submitted;
        let deadline = futures_time::task::sleep(futures_time::time::Duration::from(self.timeout)).fuse();
        pin_mut!(deadline);
        loop {
            select! {
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        trace!("Event: {:?}", event);
                        if event.completes(prompt_id) {
                            return JobState::Complete;
                        }
                        if let Some(message) = event.failure(prompt_id) {
                            warn!("Job {} failed: {}", prompt_id, message);
                            return JobState::Failed(message);
                        }
                        if state == JobState::Submitted && event.prompt_id() == Some(prompt_id) {
                            debug!("Job {} is running", prompt_id);
                            state = JobState::Running;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Notification stream broke, checking history anyway: {:#}", e);
                        return state;
                    }
                    None => {
                        warn!("Notification stream closed, checking history anyway");
                        return state;
                    }
                },
                _ = deadline => {
                    warn!("Job {} timed out after {:?}", prompt_id, self.timeout);
                    return JobState::TimedOut;
                },
            }
        }
    }

    async fn persist(&self, job: &Job<'_>, prompt_id: String, history: &HistoryEntry) -> Result<JobOutcome> {
        let roles = &job.character.nodes;
        let recorded = history.recorded_workflow();
        let workflow = recorded.as_ref().unwrap_or(job.workflow);
        let prompt = recorded_prompt(workflow, roles).unwrap_or_else(|| job.prompt.to_string());
        let seed = recorded.as_ref().and_then(|w| recorded_seed(w, roles));
        match seed {
            Some(seed) => info!("Job {} used seed {}", prompt_id, seed),
            None => debug!("Job {} has no usable seed", prompt_id),
        }
        let viewer = serializer::serialize(workflow).to_json()?;

        let refs: Vec<&ImageRef> = history.images().collect();
        let multiple = refs.len() > 1;
        let taken = chrono::Local::now().naive_local();
        let mut latest = None;
        let mut archived = vec![];
        let mut failed_images = 0;
        for (index, image) in refs.iter().enumerate() {
            let png = match self.fetch(image, &prompt, &viewer).await {
                Ok(png) => png,
                Err(e) => {
                    warn!("Skipping image {}: {:#}", image.filename, e);
                    failed_images += 1;
                    continue;
                }
            };
            if latest.is_none() {
                latest = Some(self.archive.save_latest(job.user, &png)?);
            }
            match self
                .archive
                .save_archive(job.character, &png, taken, multiple.then_some(index))
            {
                Ok(path) => archived.push(path),
                Err(e) => {
                    warn!("Failed to archive image {}: {:#}", image.filename, e);
                    failed_images += 1;
                }
            }
        }

        let Some(latest) = latest else {
            bail!(StudioError::ExecutionFailed {
                prompt_id,
                message: format!("none of the {} output images could be saved", refs.len()),
            });
        };
        info!(
            "Job {} done: {} image(s) for \"{}\"",
            prompt_id,
            archived.len(),
            trim_string(&prompt, 60)
        );
        Ok(JobOutcome {
            prompt_id,
            prompt,
            seed,
            latest,
            archived,
            failed_images,
        })
    }

    async fn fetch(&self, image: &ImageRef, prompt: &str, viewer: &str) -> Result<Vec<u8>> {
        let bytes = self.backend.view(image).await.context("failed to download image")?;
        metadata::embed(&bytes, prompt, viewer)
    }
}


#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;
    use test_log::test;

    use super::{fake::*, *};
    use crate::characters::CharacterBook;

    fn alice() -> Character {
        CharacterBook::load(Path::new("testdata/characters.yaml"))
            .unwrap()
            .get("Alice Liddell")
            .unwrap()
            .clone()
    }

    fn dispatcher(backend: Arc<FakeBackend>, root: &Path) -> Dispatcher {
        Dispatcher::new(
            backend,
            ImageArchive::new(root.join("images"), root.join("latest")),
            Duration::from_millis(200),
        )
    }

    fn template() -> Workflow {
        Workflow::load(Path::new("testdata/workflows/alice.json")).unwrap()
    }

    #[test]
    fn test_event_filtering() {
        let done = ServerEvent::parse(r#"{"type":"executing","data":{"node":null,"prompt_id":"a"}}"#).unwrap();
        assert!(done.completes("a"));
        assert!(!done.completes("b"));
        let busy = ServerEvent::parse(r#"{"type":"executing","data":{"node":"3","prompt_id":"a"}}"#).unwrap();
        assert!(!busy.completes("a"));
        let error = ServerEvent::parse(
            r#"{"type":"execution_error","data":{"prompt_id":"a","exception_message":"out of memory\n"}}"#,
        )
        .unwrap();
        assert_eq!(error.failure("a").as_deref(), Some("out of memory"));
        assert_eq!(error.failure("b"), None);
        assert!(ServerEvent::parse("not json").is_err());
    }

    #[test]
    fn test_history_shapes() {
        let graph = json!({"25": {"class_type": "Seed (rgthree)", "inputs": {"seed": 777}}});
        let roles = NodeRoles::default();
        for prompt in [json!([1, "id", graph.clone(), {}, []]), graph.clone()] {
            let entry = HistoryEntry {
                prompt,
                ..Default::default()
            };
            let recorded = entry.recorded_workflow().unwrap();
            assert_eq!(recorded_seed(&recorded, &roles), Some(777));
        }
        let random = Workflow::from_json(r#"{"25": {"class_type": "Seed (rgthree)", "inputs": {"seed": -1}}}"#).unwrap();
        assert_eq!(recorded_seed(&random, &roles), None);
        assert!(HistoryEntry::default().recorded_workflow().is_none());
    }

    #[test(tokio::test)]
    async fn test_successful_job() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::completing(&["a.png"], 4242));
        let character = alice();
        let workflow = template();
        let outcome = dispatcher(backend.clone(), dir.path())
            .run(Job {
                user: "carol",
                character: &character,
                prompt: "asked prompt",
                workflow: &workflow,
            })
            .await
            .unwrap();

        assert_eq!(outcome.prompt_id, "job-1");
        assert_eq!(outcome.prompt, "recorded prompt");
        assert_eq!(outcome.seed, Some(4242));
        assert_eq!(outcome.failed_images, 0);
        assert_eq!(outcome.latest, dir.path().join("latest/carol/latest_image.png"));
        assert_eq!(outcome.archived.len(), 1);
        // A single image has no index in its name.
        let name = outcome.archived[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("Alice_Liddell_") && name.len() == "Alice_Liddell_20240101_000000.png".len());

        let found = metadata::read(&std::fs::read(&outcome.latest).unwrap()).unwrap();
        assert_eq!(found.prompt.as_deref(), Some("recorded prompt"));
        let viewer: Value = serde_json::from_str(&found.workflow.unwrap()).unwrap();
        assert_eq!(viewer["last_node_id"], 25);
        assert_eq!(backend.submissions(), 1);
    }

    #[test(tokio::test)]
    async fn test_partial_image_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::completing(&["a.png", "b.png", "c.png"], 1);
        backend.images.remove("b.png");
        let backend = Arc::new(backend);
        let character = alice();
        let workflow = template();
        let outcome = dispatcher(backend.clone(), dir.path())
            .run(Job {
                user: "carol",
                character: &character,
                prompt: "p",
                workflow: &workflow,
            })
            .await
            .unwrap();
        assert_eq!(outcome.failed_images, 1);
        assert_eq!(outcome.archived.len(), 2);
        let names: Vec<String> = outcome
            .archived
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names[0].ends_with("_0.png"));
        assert!(names[1].ends_with("_2.png"));
        assert_eq!(backend.views.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test(tokio::test)]
    async fn test_all_images_fail() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::completing(&["a.png"], 1);
        backend.images.clear();
        let character = alice();
        let workflow = template();
        let err = dispatcher(Arc::new(backend), dir.path())
            .run(Job {
                user: "carol",
                character: &character,
                prompt: "p",
                workflow: &workflow,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StudioError>(),
            Some(StudioError::ExecutionFailed { .. })
        ));
        assert!(!dir.path().join("latest/carol/latest_image.png").exists());
    }

    #[test(tokio::test)]
    async fn test_no_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::completing(&["a.png"], 1);
        backend.prompt_id = None;
        let backend = Arc::new(backend);
        let character = alice();
        let workflow = template();
        let err = dispatcher(backend.clone(), dir.path())
            .run(Job {
                user: "carol",
                character: &character,
                prompt: "p",
                workflow: &workflow,
            })
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<StudioError>(), Some(StudioError::NoJobId)));
        assert_eq!(backend.views.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test(tokio::test)]
    async fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::completing(&["a.png"], 1);
        *backend.notifications.lock().unwrap() = Notifications::Silent;
        let backend = Arc::new(backend);
        let character = alice();
        let workflow = template();
        let err = dispatcher(backend.clone(), dir.path())
            .run(Job {
                user: "carol",
                character: &character,
                prompt: "p",
                workflow: &workflow,
            })
            .await
            .unwrap_err();
        match err.downcast_ref::<StudioError>() {
            Some(StudioError::TimedOut { prompt_id, .. }) => assert_eq!(prompt_id, "job-1"),
            other => panic!("unexpected error {:?}", other),
        }
        // Nothing is fetched after a timeout.
        assert_eq!(backend.views.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test(tokio::test)]
    async fn test_listen_failure_submits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::completing(&["a.png"], 1);
        *backend.notifications.lock().unwrap() = Notifications::RefuseConnection;
        let backend = Arc::new(backend);
        let character = alice();
        let workflow = template();
        let result = dispatcher(backend.clone(), dir.path())
            .run(Job {
                user: "carol",
                character: &character,
                prompt: "p",
                workflow: &workflow,
            })
            .await;
        assert!(result.is_err());
        assert_eq!(backend.submissions(), 0);
    }

    #[test(tokio::test)]
    async fn test_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::completing(&["a.png"], 1);
        *backend.notifications.lock().unwrap() = Notifications::Finite(vec![event(json!({
            "type": "execution_error",
            "data": {"prompt_id": "job-1", "exception_message": "CUDA out of memory"}
        }))]);
        let character = alice();
        let workflow = template();
        let err = dispatcher(Arc::new(backend), dir.path())
            .run(Job {
                user: "carol",
                character: &character,
                prompt: "p",
                workflow: &workflow,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("CUDA out of memory"));
    }

    #[test(tokio::test)]
    async fn test_broken_stream_falls_through_to_history() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::completing(&["a.png"], 99);
        *backend.notifications.lock().unwrap() =
            Notifications::Finite(vec![Err(anyhow::anyhow!("connection reset"))]);
        let character = alice();
        let workflow = template();
        let outcome = dispatcher(Arc::new(backend), dir.path())
            .run(Job {
                user: "carol",
                character: &character,
                prompt: "p",
                workflow: &workflow,
            })
            .await
            .unwrap();
        assert_eq!(outcome.seed, Some(99));
    }

    #[test(tokio::test)]
    async fn test_missing_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::completing(&["a.png"], 1);
        backend.history = None;
        let character = alice();
        let workflow = template();
        let err = dispatcher(Arc::new(backend), dir.path())
            .run(Job {
                user: "carol",
                character: &character,
                prompt: "p",
                workflow: &workflow,
            })
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<StudioError>(), Some(StudioError::NoHistory(_))));
    }
}
