//! Page manager (C7): owns the persistent browser context, the `pageId → PageState` map, and
//! the per-page FIFO operation lock that wires C1–C6 together.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Child;
use std::sync::Arc;

use parking_lot::RwLock as SyncRwLock;
use tokio::sync::Mutex as AsyncMutex;

use crate::actions::{self, ActionOutcome, ActionRequest};
use crate::axview::{self, AxView};
use crate::config::ServiceConfig;
use crate::driver::{cdp, launch, PageDriver};
use crate::error::{Result, ServiceError};
use crate::frame_registry::FrameRegistry;
use crate::quiescence;
use crate::recorder::{ActionKind, Recorder, SnapshotArtifacts};

const DEFAULT_NAV_TIMEOUT_MS: u64 = 3_000;
const INITIAL_NAV_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, serde::Serialize)]
pub struct PageInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub url: String,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_log_path: Option<String>,
}

/// Result of `GET /api/pages/:id/structure`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureResult {
    pub structure: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_log_path: Option<String>,
}

/// One entry of `GET /api/recordings`: enough to list without reading every `actions.json`
/// body back out over the wire.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSummary {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub actions_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_action_kind: Option<crate::recorder::ActionKind>,
    pub created_at: u64,
}

/// Events the page manager fans out to C8's broadcaster.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    PageCreated(PageInfo),
    PageClosed { id: String },
    ActionRecorded { page_id: String, record: serde_json::Value },
}

pub struct PageState {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: u64,
    pub driver: PageDriver,
    pub frame_registry: SyncRwLock<FrameRegistry>,
    pub cached_xpath_map: SyncRwLock<Option<HashMap<String, String>>>,
    pub recorder: Option<AsyncMutex<Recorder>>,
    pub enable_screenshot: bool,
    pub op_lock: AsyncMutex<()>,
    /// frameId -> CDP sessionId, kept current by a background listener started at page init.
    pub attached_sessions: Arc<SyncRwLock<HashMap<String, String>>>,
}

pub struct PageManager {
    config: ServiceConfig,
    chrome: AsyncMutex<Option<Child>>,
    cdp_port: AsyncMutex<u16>,
    pages: SyncRwLock<HashMap<String, Arc<PageState>>>,
    events: tokio::sync::broadcast::Sender<ManagerEvent>,
}

impl PageManager {
    pub fn new(config: ServiceConfig) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(256);
        Self {
            config,
            chrome: AsyncMutex::new(None),
            cdp_port: AsyncMutex::new(0),
            pages: SyncRwLock::new(HashMap::new()),
            events: tx,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }

    pub fn browser_connected(&self) -> bool {
        self.cdp_port
            .try_lock()
            .map(|p| *p != 0)
            .unwrap_or(true)
    }

    async fn ensure_browser(&self) -> Result<u16> {
        let mut port_guard = self.cdp_port.lock().await;
        if *port_guard != 0 {
            return Ok(*port_guard);
        }
        let chrome_path = launch::default_chrome_path();
        let (child, port) =
            launch::launch_and_wait(&chrome_path, &self.config.user_data_dir, self.config.headless)
                .await?;
        *self.chrome.lock().await = Some(child);
        *port_guard = port;
        Ok(port)
    }

    pub async fn list_pages(&self) -> Vec<PageInfo> {
        let states: Vec<Arc<PageState>> = self.pages.read().values().cloned().collect();
        let mut out = Vec::with_capacity(states.len());
        for p in states {
            let url = p.driver.url().await.unwrap_or_default();
            let console_log_path = match &p.recorder {
                Some(recorder) => Some(recorder.lock().await.console_log_path().display().to_string()),
                None => None,
            };
            out.push(PageInfo {
                id: p.id.clone(),
                name: p.name.clone(),
                description: p.description.clone(),
                url,
                created_at: p.created_at,
                console_log_path,
            });
        }
        out
    }

    /// Same as [`Self::list_pages`] for a single page, plus the page's current `<title>`.
    pub async fn get_page_info(&self, id: &str) -> Result<(PageInfo, String)> {
        let state = self.get_page(id)?;
        let url = state.driver.url().await.unwrap_or_default();
        let title = state.driver.title().await.unwrap_or_default();
        let console_log_path = match &state.recorder {
            Some(recorder) => Some(recorder.lock().await.console_log_path().display().to_string()),
            None => None,
        };
        Ok((
            PageInfo {
                id: state.id.clone(),
                name: state.name.clone(),
                description: state.description.clone(),
                url,
                created_at: state.created_at,
                console_log_path,
            },
            title,
        ))
    }

    fn get_page(&self, id: &str) -> Result<Arc<PageState>> {
        self.pages
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::PageNotFound(id.to_string()))
    }

    /// Create a page bound to the persistent browser context, initialize its CDP session, fire
    /// the `create` action, and navigate to `url`.
    pub async fn create_page(
        &self,
        name: String,
        url: &str,
        description: Option<String>,
        timeout_ms: Option<u64>,
        record_actions: bool,
    ) -> Result<PageInfo> {
        let port = self.ensure_browser().await?;
        let target = cdp::new_page_target(port, "about:blank").await?;
        let driver = PageDriver::connect(&target, port).await?;
        driver.init().await?;

        let page_id = uuid::Uuid::new_v4().to_string();
        let created_at = now_ms();

        let recorder = if record_actions {
            let page_dir = self.config.page_dir(&page_id);
            Some(AsyncMutex::new(
                Recorder::init(page_dir, &page_id, &name, description.clone()).await?,
            ))
        } else {
            None
        };

        let attached_sessions = Arc::new(SyncRwLock::new(HashMap::new()));
        spawn_attach_listener(&driver, attached_sessions.clone());

        let state = Arc::new(PageState {
            id: page_id.clone(),
            name: name.clone(),
            description: description.clone(),
            created_at,
            driver,
            frame_registry: SyncRwLock::new(FrameRegistry::new()),
            cached_xpath_map: SyncRwLock::new(None),
            recorder,
            enable_screenshot: self.config.screenshot,
            op_lock: AsyncMutex::new(()),
            attached_sessions,
        });

        self.pages.write().insert(page_id.clone(), state.clone());

        if state.recorder.is_some() {
            spawn_console_listener(state.clone());
        }

        if let Some(recorder) = &state.recorder {
            let mut rec = recorder.lock().await;
            let _ = rec.append(
                ActionKind::Create,
                serde_json::json!({"name": name, "url": url}),
                None,
                None,
            );
        }

        let console_log_path = if let Some(recorder) = &state.recorder {
            Some(recorder.lock().await.console_log_path().display().to_string())
        } else {
            None
        };

        let info = PageInfo {
            id: page_id.clone(),
            name,
            description,
            url: url.to_string(),
            created_at,
            console_log_path,
        };

        if state.recorder.is_some() {
            let _ = self.events.send(ManagerEvent::PageCreated(info.clone()));
        }

        let _ = state
            .driver
            .navigate(url, timeout_ms.unwrap_or(INITIAL_NAV_TIMEOUT_MS))
            .await;

        Ok(info)
    }

    pub async fn close_page(&self, id: &str) -> Result<()> {
        let state = self.get_page(id)?;
        let _guard = state.op_lock.lock().await;
        if let Some(recorder) = &state.recorder {
            let mut rec = recorder.lock().await;
            let _ = rec.record_close();
        }
        let _ = state.driver.close().await;
        self.pages.write().remove(id);
        let _ = self
            .events
            .send(ManagerEvent::PageClosed { id: id.to_string() });
        Ok(())
    }

    async fn with_lock<F, Fut, T>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<PageState>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let state = self.get_page(id)?;
        let _guard = state.op_lock.lock().await;
        f(state).await
    }

    pub async fn navigate(&self, id: &str, url: &str, timeout_ms: Option<u64>, description: Option<String>) -> Result<String> {
        self.with_lock(id, |state| async move {
            let final_url = state
                .driver
                .navigate(url, timeout_ms.unwrap_or(DEFAULT_NAV_TIMEOUT_MS))
                .await?;
            state.frame_registry.write().reset();
            self.record_simple(&state, ActionKind::Navigate, serde_json::json!({"url": url}), description)
                .await;
            Ok(final_url)
        })
        .await
    }

    pub async fn navigate_back(&self, id: &str, description: Option<String>) -> Result<String> {
        self.with_lock(id, |state| async move {
            state.driver.back().await?;
            quiescence::wait_for_settled(state.driver.subscribe_events(), None).await;
            let url = state.driver.url().await?;
            self.record_simple(&state, ActionKind::NavigateBack, serde_json::json!({}), description)
                .await;
            Ok(url)
        })
        .await
    }

    pub async fn navigate_forward(&self, id: &str, description: Option<String>) -> Result<String> {
        self.with_lock(id, |state| async move {
            state.driver.forward().await?;
            quiescence::wait_for_settled(state.driver.subscribe_events(), None).await;
            let url = state.driver.url().await?;
            self.record_simple(&state, ActionKind::NavigateForward, serde_json::json!({}), description)
                .await;
            Ok(url)
        })
        .await
    }

    pub async fn reload(&self, id: &str, timeout_ms: Option<u64>) -> Result<String> {
        self.with_lock(id, |state| async move {
            let url = state
                .driver
                .reload(timeout_ms.unwrap_or(DEFAULT_NAV_TIMEOUT_MS))
                .await?;
            self.record_simple(&state, ActionKind::Reload, serde_json::json!({}), None)
                .await;
            Ok(url)
        })
        .await
    }

    pub async fn wait(&self, id: &str, timeout_ms: u64, description: Option<String>) -> Result<()> {
        self.with_lock(id, |state| async move {
            quiescence::wait_for_settled(state.driver.subscribe_events(), Some(timeout_ms)).await;
            self.record_simple(&state, ActionKind::Wait, serde_json::json!({"timeout": timeout_ms}), description)
                .await;
            Ok(())
        })
        .await
    }

    pub async fn condition(
        &self,
        id: &str,
        pattern: &str,
        flags: Option<&str>,
        description: Option<String>,
    ) -> Result<bool> {
        self.with_lock(id, |state| async move {
            let view = self.build_view(&state, None).await?;
            let case_insensitive = flags.map(|f| f.contains('i')).unwrap_or(false);
            let re = if case_insensitive {
                regex::RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
            } else {
                regex::RegexBuilder::new(pattern).build()
            }
            .map_err(|e| ServiceError::BadRequest(format!("invalid regex: {e}")))?;
            let matched = re.is_match(&view.simplified);
            self.record_simple(
                &state,
                ActionKind::Condition,
                serde_json::json!({"pattern": pattern, "matched": matched}),
                description,
            )
            .await;
            Ok(matched)
        })
        .await
    }

    pub async fn structure(&self, id: &str, selector: Option<&str>) -> Result<StructureResult> {
        let state = self.get_page(id)?;
        let _guard = state.op_lock.lock().await;
        let view = self.build_view(&state, selector).await?;

        let (html_path, actions_path, console_log_path) = match &state.recorder {
            Some(recorder) => {
                let mut rec = recorder.lock().await;
                let html = state.driver.content().await.unwrap_or_default();
                let html_path = rec
                    .write_page_html(now_ms(), &html)
                    .ok()
                    .map(|name| rec.data_dir().join(name).display().to_string());
                (
                    html_path,
                    Some(rec.actions_path().display().to_string()),
                    Some(rec.console_log_path().display().to_string()),
                )
            }
            None => (None, None, None),
        };

        Ok(StructureResult {
            structure: view.simplified,
            html_path,
            actions_path,
            console_log_path,
        })
    }

    pub async fn act(&self, id: &str, req: ActionRequest) -> Result<ActionOutcome> {
        self.with_lock(id, |state| async move {
            let cached = state.cached_xpath_map.read().clone();
            let description = req.description.clone();
            let mut params = serde_json::json!({
                "method": req.method.as_str(),
                "args": req.args,
            });
            match &req.target {
                actions::Target::Xpath(xp) => params["xpath"] = serde_json::json!(xp),
                actions::Target::EncodedId(encoded_id) => {
                    params["encodedId"] = serde_json::json!(encoded_id)
                }
            }
            let outcome = actions::execute(&state.driver, cached.as_ref(), &req).await?;
            self.record_simple(&state, ActionKind::Act, params, description)
                .await;
            Ok(outcome)
        })
        .await
    }

    /// Resolve `selector` (CSS or xpath; the driver's search accepts either transparently) to
    /// every matching element's `outerHTML`, write the extraction artifact, and attach it to
    /// the recorded action.
    pub async fn get_list_html(&self, id: &str, selector: &str, description: Option<String>) -> Result<(String, usize)> {
        self.with_lock(id, |state| async move {
            let node_ids = state.driver.query_all_node_ids(selector).await?;
            let mut items = Vec::with_capacity(node_ids.len());
            for node_id in node_ids {
                items.push(state.driver.outer_html_for_node_id(node_id).await?);
            }
            let count = items.len();
            let file = self
                .record_with_list(&state, ActionKind::GetListHtml, serde_json::json!({"selector": selector}), description, &items)
                .await?;
            Ok((file, count))
        })
        .await
    }

    /// Resolve `selector` to its first matching element, then extract every direct child's
    /// `outerHTML` — the "by parent" variant of [`Self::get_list_html`].
    pub async fn get_list_html_by_parent(&self, id: &str, selector: &str, description: Option<String>) -> Result<(String, usize)> {
        self.with_lock(id, |state| async move {
            let node_id = state.driver.first_node_id(selector).await?;
            let items = state.driver.children_outer_html_for_node_id(node_id).await?;
            let count = items.len();
            let file = self
                .record_with_list(&state, ActionKind::GetListHtmlByParent, serde_json::json!({"selector": selector}), description, &items)
                .await?;
            Ok((file, count))
        })
        .await
    }

    /// Resolve `selector` to its first matching element and extract its `outerHTML`.
    pub async fn get_element_html(&self, id: &str, selector: &str, description: Option<String>) -> Result<String> {
        self.with_lock(id, |state| async move {
            let node_id = state.driver.first_node_id(selector).await?;
            let html = state.driver.outer_html_for_node_id(node_id).await?;
            let file = self
                .record_with_element(&state, ActionKind::GetElementHtml, serde_json::json!({"selector": selector}), description, &html)
                .await?;
            Ok(file)
        })
        .await
    }

    pub async fn delete_action(&self, id: &str, idx: usize) -> Result<()> {
        let state = self.get_page(id)?;
        let _guard = state.op_lock.lock().await;
        let recorder = state
            .recorder
            .as_ref()
            .ok_or_else(|| ServiceError::RecordingNotFound(id.to_string()))?;
        recorder.lock().await.delete_action(idx)
    }

    /// Recursively remove the page's recording directory and drop its in-memory state,
    /// regardless of whether the page is currently open.
    pub async fn delete_all_records(&self, id: &str) -> Result<()> {
        if let Some(state) = self.pages.write().remove(id) {
            let _ = state.driver.close().await;
        }
        let page_dir = self.config.page_dir(id);
        if page_dir.exists() {
            std::fs::remove_dir_all(&page_dir)
                .map_err(|e| ServiceError::FilesystemError(e.to_string()))?;
        }
        Ok(())
    }

    /// Scan the recordings root for subfolders containing `actions.json` and summarize each.
    pub fn list_recordings(&self) -> Result<Vec<RecordingSummary>> {
        let root = self.recordings_root();
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&root) else {
            return Ok(out);
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let actions_path = path.join("actions.json");
            if !actions_path.is_file() {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&actions_path) else {
                continue;
            };
            let Ok(file) = serde_json::from_str::<crate::recorder::ActionsFile>(&content) else {
                continue;
            };
            let created_at = file
                .actions
                .first()
                .map(|a| a.timestamp)
                .or_else(|| entry.metadata().ok().and_then(|m| m.modified().ok()).map(|t| {
                    t.duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_millis() as u64
                }))
                .unwrap_or(0);
            out.push(RecordingSummary {
                id: file.id,
                name: file.name,
                description: file.description,
                actions_count: file.actions.len(),
                last_action_kind: file.actions.last().map(|a| a.kind),
                created_at,
            });
        }
        Ok(out)
    }

    /// Read one recording's full `actions.json`, plus the paths a caller needs to serve its
    /// artifacts.
    pub fn read_recording(&self, id: &str) -> Result<(crate::recorder::ActionsFile, PathBuf, PathBuf)> {
        let base_path = self.page_recorder_dir(id);
        let actions_path = base_path.join("actions.json");
        if !actions_path.is_file() {
            return Err(ServiceError::RecordingNotFound(id.to_string()));
        }
        let content = std::fs::read_to_string(&actions_path)
            .map_err(|e| ServiceError::FilesystemError(e.to_string()))?;
        let file: crate::recorder::ActionsFile = serde_json::from_str(&content)?;
        let data_path = base_path.join("data");
        Ok((file, base_path, data_path))
    }

    pub async fn screenshot(&self, id: &str) -> Result<Vec<u8>> {
        let state = self.get_page(id)?;
        let _guard = state.op_lock.lock().await;
        state.driver.screenshot().await
    }

    pub async fn xpath_for(&self, id: &str, encoded_id: &str) -> Result<String> {
        let state = self.get_page(id)?;
        let _guard = state.op_lock.lock().await;
        let cached = state.cached_xpath_map.read().clone();
        cached
            .and_then(|m| m.get(encoded_id).cloned())
            .ok_or_else(|| ServiceError::NoXPathForEncodedId(encoded_id.to_string()))
    }

    async fn build_view(&self, state: &Arc<PageState>, selector: Option<&str>) -> Result<AxView> {
        let attached = state.attached_sessions.read().clone();
        let mut registry = state.frame_registry.write();
        let view = axview::build(&state.driver, &attached, &mut registry, selector).await?;
        *state.cached_xpath_map.write() = Some(view.xpath_map.clone());
        Ok(view)
    }

    async fn record_simple(
        &self,
        state: &Arc<PageState>,
        kind: ActionKind,
        params: serde_json::Value,
        description: Option<String>,
    ) {
        let Some(recorder) = &state.recorder else {
            return;
        };
        let snapshot = self.snapshot_for(state).await;
        let mut rec = recorder.lock().await;
        match rec.append(kind, params, description, snapshot) {
            Ok(record) => self.broadcast_action(state, &record),
            Err(e) => tracing::error!(error = %e, "failed to append action record"),
        }
    }

    /// Like [`Self::record_simple`], but also writes the list-extraction artifact and attaches
    /// it to the freshly appended record. Returns the artifact's filename.
    async fn record_with_list(
        &self,
        state: &Arc<PageState>,
        kind: ActionKind,
        params: serde_json::Value,
        description: Option<String>,
        items: &[String],
    ) -> Result<String> {
        let Some(recorder) = &state.recorder else {
            return Err(ServiceError::RecordingNotFound(state.id.clone()));
        };
        let snapshot = self.snapshot_for(state).await;
        let ts = now_ms();
        let mut rec = recorder.lock().await;
        let mut record = rec.append(kind, params, description, snapshot)?;
        let file = rec.write_list_file(ts, items)?;
        rec.attach_list_file(record.index, file.clone())?;
        record.list_file = Some(file.clone());
        drop(rec);
        self.broadcast_action(state, &record);
        Ok(file)
    }

    /// Like [`Self::record_with_list`] for a single-element extraction.
    async fn record_with_element(
        &self,
        state: &Arc<PageState>,
        kind: ActionKind,
        params: serde_json::Value,
        description: Option<String>,
        html: &str,
    ) -> Result<String> {
        let Some(recorder) = &state.recorder else {
            return Err(ServiceError::RecordingNotFound(state.id.clone()));
        };
        let snapshot = self.snapshot_for(state).await;
        let ts = now_ms();
        let mut rec = recorder.lock().await;
        let mut record = rec.append(kind, params, description, snapshot)?;
        let file = rec.write_element_file(ts, html)?;
        rec.attach_element_file(record.index, file.clone())?;
        record.element_file = Some(file.clone());
        drop(rec);
        self.broadcast_action(state, &record);
        Ok(file)
    }

    async fn snapshot_for(&self, state: &Arc<PageState>) -> Option<SnapshotArtifacts> {
        match self.build_view(state, None).await {
            Ok(view) => Some(SnapshotArtifacts {
                outline: view.simplified,
                xpath_map: view.xpath_map,
                screenshot_png: if state.enable_screenshot {
                    state.driver.screenshot().await.ok()
                } else {
                    None
                },
            }),
            Err(e) => {
                tracing::warn!(error = %e, "snapshot capture failed, recording action without artifacts");
                None
            }
        }
    }

    fn broadcast_action(&self, state: &Arc<PageState>, record: &crate::recorder::ActionRecord) {
        if let Ok(value) = serde_json::to_value(record) {
            let _ = self.events.send(ManagerEvent::ActionRecorded {
                page_id: state.id.clone(),
                record: value,
            });
        }
    }

    pub fn recordings_root(&self) -> PathBuf {
        self.config.recordings_index_dir()
    }

    pub fn page_recorder_dir(&self, id: &str) -> PathBuf {
        self.config.page_dir(id)
    }
}

/// Keep `PageState::attached_sessions` current by listening for `Target.attachedToTarget`
/// (iframe sessions join) and `Target.detachedFromTarget` (they leave) for the page's whole
/// lifetime.
fn spawn_attach_listener(driver: &PageDriver, attached: Arc<SyncRwLock<HashMap<String, String>>>) {
    let mut rx = driver.subscribe_events();
    tokio::spawn(async move {
        while let Ok(ev) = rx.recv().await {
            match ev.method.as_str() {
                "Target.attachedToTarget" => {
                    let target_type = ev
                        .params
                        .get("targetInfo")
                        .and_then(|t| t.get("type"))
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    if target_type != "iframe" {
                        continue;
                    }
                    let Some(session_id) = ev.params.get("sessionId").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let Some(target_id) = ev
                        .params
                        .get("targetInfo")
                        .and_then(|t| t.get("targetId"))
                        .and_then(|v| v.as_str())
                    else {
                        continue;
                    };
                    attached
                        .write()
                        .insert(target_id.to_string(), session_id.to_string());
                }
                "Target.detachedFromTarget" => {
                    let Some(session_id) = ev.params.get("sessionId").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    attached.write().retain(|_, v| v != session_id);
                }
                _ => {}
            }
        }
    });
}

/// Fire-and-forget console/page-error capture for the page's lifetime. Failures never affect
/// actions; a dead recorder mutex (page closed) just ends the loop on the next recv.
fn spawn_console_listener(state: Arc<PageState>) {
    let mut rx = state.driver.subscribe_events();
    tokio::spawn(async move {
        while let Ok(ev) = rx.recv().await {
            let Some(recorder) = &state.recorder else { return };
            match ev.method.as_str() {
                "Runtime.consoleAPICalled" => {
                    let level = ev
                        .params
                        .get("type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("log");
                    let message = ev
                        .params
                        .get("args")
                        .and_then(|v| v.as_array())
                        .map(|args| {
                            args.iter()
                                .map(console_arg_to_string)
                                .collect::<Vec<_>>()
                                .join(" ")
                        })
                        .unwrap_or_default();
                    let stack = ev
                        .params
                        .get("stackTrace")
                        .and_then(|v| v.get("description"))
                        .and_then(|v| v.as_str());
                    recorder
                        .lock()
                        .await
                        .write_console_line(level, &message, stack)
                        .await;
                }
                "Runtime.exceptionThrown" => {
                    let detail = ev.params.get("exceptionDetails");
                    let message = detail
                        .and_then(|d| d.get("exception"))
                        .and_then(|e| e.get("description"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("uncaught exception")
                        .to_string();
                    let stack = detail
                        .and_then(|d| d.get("exception"))
                        .and_then(|e| e.get("description"))
                        .and_then(|v| v.as_str());
                    recorder.lock().await.write_page_error(&message, stack).await;
                }
                _ => {}
            }
        }
    });
}

fn console_arg_to_string(arg: &serde_json::Value) -> String {
    arg.get("value")
        .map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .or_else(|| {
            arg.get("description")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
        .unwrap_or_default()
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_not_found_when_absent() {
        let manager = PageManager::new(ServiceConfig {
            port: 3100,
            headless: true,
            user_data_dir: PathBuf::from("/tmp/ud"),
            screenshot: false,
            recordings_root: PathBuf::from("/tmp"),
            cors_origin: "*".to_string(),
        });
        assert!(manager.get_page("missing").is_err());
    }

    #[tokio::test]
    async fn list_pages_empty_initially() {
        let manager = PageManager::new(ServiceConfig {
            port: 3100,
            headless: true,
            user_data_dir: PathBuf::from("/tmp/ud"),
            screenshot: false,
            recordings_root: PathBuf::from("/tmp"),
            cors_origin: "*".to_string(),
        });
        assert_eq!(manager.list_pages().await.len(), 0);
        assert_eq!(manager.page_count(), 0);
    }
}
