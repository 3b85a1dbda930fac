use std::sync::Arc;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::{
    buffer::{BufferManager, BufferStatus, CLEANUP_INTERVAL, Pressure, pressure_for},
    capture::CapturePipeline,
    clip::{ClipBuilder, ClipError, ClipReceipt, ClipRequest},
    config::{Config, Settings, SettingsSnapshot},
    har::BrowserInfo,
    store::{CAPTURE_DB_FILENAME, META_PAUSED, Store, StoreError},
    tap::{Tap, TapEvent},
    uploader::{RemoteError, Uploader},
};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tab lifecycle and network traffic as delivered by the host, one line of
/// the tap feed each.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TabEvent {
    TabCreated {
        tab_id: i64,
        url: String,
    },
    TabNavigated {
        tab_id: i64,
        url: String,
    },
    TabClosed {
        tab_id: i64,
    },
    Network {
        tab_id: i64,
        #[serde(flatten)]
        event: TapEvent,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStatus {
    pub paused: bool,
    pub attached_tabs: usize,
    pub pending_http: usize,
    pub open_ws: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub usage_bytes: u64,
    pub quota_bytes: u64,
    pub cap_bytes: u64,
    pub pressure: Pressure,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub capture: CaptureStatus,
    pub buffer: BufferStatus,
    pub storage: StorageStatus,
}

/// Reply shape of the clip request contract. An empty result set is a
/// success.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClipResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_id: Option<String>,
    pub entry_count: u64,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<ClipReceipt, ClipError>> for ClipResponse {
    fn from(value: Result<ClipReceipt, ClipError>) -> Self {
        match value {
            Ok(receipt) => Self {
                success: true,
                clip_id: receipt.clip_id,
                entry_count: receipt.entry_count,
                size_bytes: receipt.size_bytes,
                error: None,
            },
            Err(err) => Self {
                success: false,
                clip_id: None,
                entry_count: 0,
                size_bytes: 0,
                error: Some(err.to_string()),
            },
        }
    }
}

enum Command {
    GetStatus(oneshot::Sender<Result<EngineStatus, StoreError>>),
    CreateClip(ClipRequest, oneshot::Sender<ClipResponse>),
    PauseCapture(oneshot::Sender<()>),
    ResumeCapture(oneshot::Sender<()>),
    ClearBuffer(oneshot::Sender<Result<(), StoreError>>),
    TestConnection {
        url: String,
        key: String,
        reply: oneshot::Sender<Result<(), RemoteError>>,
    },
    GetCaptureStatus(oneshot::Sender<CaptureStatus>),
    GetBufferStatus(oneshot::Sender<Result<BufferStatus, StoreError>>),
    GetStorageStatus(oneshot::Sender<Result<StorageStatus, StoreError>>),
    RunCleanup(oneshot::Sender<()>),
}

/// What the dispatcher loop should do after a command or settings edge.
enum Action {
    None,
    TriggerCleanup,
}

/// Handle to a running engine: the command surface plus the tap feed inlet.
/// Dropping the handle (or calling `shutdown`) stops the engine.
#[derive(Debug)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<Command>,
    event_tx: mpsc::Sender<TabEvent>,
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl EngineHandle {
    pub fn event_sender(&self) -> mpsc::Sender<TabEvent> {
        self.event_tx.clone()
    }

    pub async fn deliver(&self, event: TabEvent) -> anyhow::Result<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("engine stopped"))
    }

    pub async fn get_status(&self) -> anyhow::Result<EngineStatus> {
        Ok(self.request(Command::GetStatus).await??)
    }

    pub async fn create_clip(&self, request: ClipRequest) -> anyhow::Result<ClipResponse> {
        self.request(|reply| Command::CreateClip(request, reply))
            .await
    }

    pub async fn pause_capture(&self) -> anyhow::Result<()> {
        self.request(Command::PauseCapture).await
    }

    pub async fn resume_capture(&self) -> anyhow::Result<()> {
        self.request(Command::ResumeCapture).await
    }

    pub async fn clear_buffer(&self) -> anyhow::Result<()> {
        Ok(self.request(Command::ClearBuffer).await??)
    }

    pub async fn test_connection(&self, url: String, key: String) -> anyhow::Result<Result<(), RemoteError>> {
        self.request(|reply| Command::TestConnection { url, key, reply })
            .await
    }

    pub async fn get_capture_status(&self) -> anyhow::Result<CaptureStatus> {
        self.request(Command::GetCaptureStatus).await
    }

    pub async fn get_buffer_status(&self) -> anyhow::Result<BufferStatus> {
        Ok(self.request(Command::GetBufferStatus).await??)
    }

    pub async fn get_storage_status(&self) -> anyhow::Result<StorageStatus> {
        Ok(self.request(Command::GetStorageStatus).await??)
    }

    pub async fn run_cleanup(&self) -> anyhow::Result<()> {
        self.request(Command::RunCleanup).await
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> anyhow::Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("engine stopped"))?;
        reply_rx.await.context("engine dropped the reply")
    }
}

struct Engine {
    store: Store,
    settings: Settings,
    pipeline: CapturePipeline,
    buffer: BufferManager,
    clips: ClipBuilder,
    last_settings: SettingsSnapshot,
}

/// Boots the engine from configuration and returns its handle. The `paused`
/// flag persisted in store metadata is authoritative over the config value.
pub async fn spawn(config: &Config, tap: Arc<dyn Tap>) -> anyhow::Result<EngineHandle> {
    let store = Store::open(config.storage.path.join(CAPTURE_DB_FILENAME))
        .context("open capture store")?;
    let settings = Settings::from_config(config);

    if let Some(paused) = store
        .get_meta::<bool>(META_PAUSED)
        .await
        .context("read persisted paused flag")?
    {
        settings.set_paused(paused);
    }

    let browser = config
        .browser
        .as_ref()
        .map(|browser| BrowserInfo {
            name: browser.name.clone(),
            version: browser.version.clone(),
        })
        .unwrap_or_default();

    let snapshot = settings.snapshot();
    let pipeline = CapturePipeline::new(tap, store.clone(), snapshot.paused);
    let buffer = BufferManager::new(store.clone(), settings.clone());
    let clips = ClipBuilder::new(store.clone(), settings.clone(), browser);

    let settings_rx = settings.subscribe();
    let engine = Engine {
        store,
        settings,
        pipeline,
        buffer,
        clips,
        last_settings: snapshot,
    };

    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let join = tokio::spawn(engine.run(command_rx, event_rx, settings_rx, shutdown_rx));

    Ok(EngineHandle {
        command_tx,
        event_tx,
        shutdown_tx,
        join,
    })
}

impl Engine {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<Command>,
        mut event_rx: mpsc::Receiver<TabEvent>,
        mut settings_rx: watch::Receiver<SettingsSnapshot>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // A cleanup pass runs off the dispatcher so capture appends can
        // interleave; a trigger while one runs queues at most one follow-up.
        let mut cleanup_task: Option<JoinHandle<()>> = None;
        let mut cleanup_queued = false;

        loop {
            // Events drain before settings edges, which apply before the
            // next command; commands therefore observe the state every
            // previously delivered event produced.
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => break,
                Some(event) = event_rx.recv() => {
                    self.handle_tab_event(event).await;
                }
                changed = settings_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let snapshot = settings_rx.borrow_and_update().clone();
                    match self.apply_settings_change(snapshot).await {
                        Action::TriggerCleanup => {
                            start_or_queue_cleanup(
                                &self.buffer,
                                &mut cleanup_task,
                                &mut cleanup_queued,
                            );
                        }
                        Action::None => {}
                    }
                }
                Some(command) = command_rx.recv() => {
                    match self.handle_command(command).await {
                        Action::TriggerCleanup => {
                            start_or_queue_cleanup(
                                &self.buffer,
                                &mut cleanup_task,
                                &mut cleanup_queued,
                            );
                        }
                        Action::None => {}
                    }
                }
                _ = ticker.tick() => {
                    start_or_queue_cleanup(&self.buffer, &mut cleanup_task, &mut cleanup_queued);
                }
                _ = async { cleanup_task.as_mut().expect("guarded by is_some").await },
                    if cleanup_task.is_some() =>
                {
                    cleanup_task = None;
                    if cleanup_queued {
                        cleanup_queued = false;
                        start_or_queue_cleanup(
                            &self.buffer,
                            &mut cleanup_task,
                            &mut cleanup_queued,
                        );
                    }
                }
            }
        }

        if let Some(task) = cleanup_task {
            let _ = task.await;
        }
        self.store.close();
    }

    async fn handle_tab_event(&mut self, event: TabEvent) {
        match event {
            TabEvent::TabCreated { tab_id, url } => {
                self.pipeline.handle_tab_created(tab_id, url).await;
            }
            TabEvent::TabNavigated { tab_id, url } => {
                self.pipeline.handle_tab_navigated(tab_id, url).await;
            }
            TabEvent::TabClosed { tab_id } => {
                self.pipeline.handle_tab_closed(tab_id).await;
            }
            TabEvent::Network { tab_id, event } => {
                self.pipeline.handle_event(tab_id, event).await;
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Action {
        match command {
            Command::GetStatus(reply) => {
                let _ = reply.send(self.engine_status().await);
                Action::None
            }
            Command::CreateClip(request, reply) => {
                let clips = self.clips.clone();
                tokio::spawn(async move {
                    // A caller that walked away closes its reply half; the
                    // builder polls that between phases.
                    let result = {
                        let cancelled = || reply.is_closed();
                        clips.create_clip(request, &cancelled).await
                    };
                    if let Err(err) = &result {
                        tracing::warn!(error = %err, "clip request failed");
                    }
                    let _ = reply.send(ClipResponse::from(result));
                });
                Action::None
            }
            Command::PauseCapture(reply) => {
                self.set_paused(true).await;
                let _ = reply.send(());
                Action::None
            }
            Command::ResumeCapture(reply) => {
                self.set_paused(false).await;
                let _ = reply.send(());
                Action::None
            }
            Command::ClearBuffer(reply) => {
                let _ = reply.send(self.store.clear_all().await);
                Action::None
            }
            Command::TestConnection { url, key, reply } => {
                tokio::spawn(async move {
                    let _ = reply.send(Uploader::test_connection(&url, &key).await);
                });
                Action::None
            }
            Command::GetCaptureStatus(reply) => {
                let _ = reply.send(self.capture_status());
                Action::None
            }
            Command::GetBufferStatus(reply) => {
                let _ = reply.send(self.buffer.status().await);
                Action::None
            }
            Command::GetStorageStatus(reply) => {
                let _ = reply.send(self.storage_status().await);
                Action::None
            }
            Command::RunCleanup(reply) => {
                let _ = reply.send(());
                Action::TriggerCleanup
            }
        }
    }

    async fn apply_settings_change(&mut self, snapshot: SettingsSnapshot) -> Action {
        let mut action = Action::None;

        if snapshot.paused != self.last_settings.paused {
            if snapshot.paused {
                self.pipeline.pause().await;
            } else {
                self.pipeline.resume().await;
            }
        }
        if snapshot.cap != self.last_settings.cap {
            action = Action::TriggerCleanup;
        }

        self.last_settings = snapshot;
        action
    }

    async fn set_paused(&mut self, paused: bool) {
        self.settings.set_paused(paused);
        if let Err(err) = self.store.put_meta(META_PAUSED, &paused).await {
            tracing::warn!(error = %err, "persist paused flag failed");
        }
    }

    fn capture_status(&self) -> CaptureStatus {
        let counts = self.pipeline.counts();
        CaptureStatus {
            paused: self.pipeline.is_paused(),
            attached_tabs: counts.attached_tabs,
            pending_http: counts.pending_http,
            open_ws: counts.open_ws,
        }
    }

    async fn storage_status(&self) -> Result<StorageStatus, StoreError> {
        let estimate = self.store.estimate_usage().await?;
        let cap_bytes = self.settings.cap_bytes();
        Ok(StorageStatus {
            usage_bytes: estimate.usage_bytes,
            quota_bytes: estimate.quota_bytes,
            cap_bytes,
            pressure: pressure_for(estimate.usage_bytes, cap_bytes),
        })
    }

    async fn engine_status(&self) -> Result<EngineStatus, StoreError> {
        Ok(EngineStatus {
            capture: self.capture_status(),
            buffer: self.buffer.status().await?,
            storage: self.storage_status().await?,
        })
    }
}

fn start_or_queue_cleanup(
    buffer: &BufferManager,
    cleanup_task: &mut Option<JoinHandle<()>>,
    cleanup_queued: &mut bool,
) {
    if cleanup_task.is_some() {
        *cleanup_queued = true;
        return;
    }
    let buffer = buffer.clone();
    *cleanup_task = Some(tokio::spawn(async move {
        if let Err(err) = buffer.run_pass().await {
            tracing::warn!(error = %err, "cleanup pass failed");
        }
    }));
}
