//! Session recorder (C6): owns one page's on-disk directory, appends actions with their
//! pre-action snapshot artifacts, and exposes the deletion/console-capture contracts of §4.6.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{Result, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    Create,
    Navigate,
    NavigateBack,
    NavigateForward,
    Reload,
    Wait,
    Condition,
    Act,
    GetListHtml,
    GetListHtmlByParent,
    GetElementHtml,
    Close,
}

impl ActionKind {
    fn captures_snapshot(self) -> bool {
        self != ActionKind::Close
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub index: usize,
    pub kind: ActionKind,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "xpathMap")]
    pub xpath_map: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "listFile")]
    pub list_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "elementFile")]
    pub element_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionsFile {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub actions: Vec<ActionRecord>,
}

/// Snapshot artifacts to persist alongside a non-close action.
pub struct SnapshotArtifacts {
    pub outline: String,
    pub xpath_map: HashMap<String, String>,
    pub screenshot_png: Option<Vec<u8>>,
}

pub struct Recorder {
    page_dir: PathBuf,
    data_dir: PathBuf,
    file: ActionsFile,
    console_log_path: PathBuf,
    console_writer: Option<tokio::fs::File>,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Recorder {
    /// Create (or reopen) the page's recording directory: `<dir>/` and `<dir>/data/`, plus a
    /// fresh console capture stream.
    pub async fn init(page_dir: PathBuf, page_id: &str, name: &str, description: Option<String>) -> Result<Self> {
        let data_dir = page_dir.join("data");
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| ServiceError::FilesystemError(e.to_string()))?;

        let actions_path = page_dir.join("actions.json");
        let file = if actions_path.exists() {
            let content = std::fs::read_to_string(&actions_path)
                .map_err(|e| ServiceError::FilesystemError(e.to_string()))?;
            serde_json::from_str(&content)?
        } else {
            let seeded = ActionsFile {
                id: page_id.to_string(),
                name: name.to_string(),
                description,
                actions: Vec::new(),
            };
            write_actions_file(&actions_path, &seeded)?;
            seeded
        };

        let ts = now_ms();
        let console_log_path = data_dir.join(format!("console-{ts}.log"));
        let console_writer = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&console_log_path)
            .await
            .ok();

        Ok(Self {
            page_dir,
            data_dir,
            file,
            console_log_path,
            console_writer,
        })
    }

    pub fn console_log_path(&self) -> &Path {
        &self.console_log_path
    }

    pub fn actions_path(&self) -> PathBuf {
        self.page_dir.join("actions.json")
    }

    pub fn actions_file(&self) -> &ActionsFile {
        &self.file
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Build the record, write its snapshot artifacts (unless `kind` is `Close`), push it into
    /// the in-memory log, and rewrite `actions.json` whole.
    pub fn append(
        &mut self,
        kind: ActionKind,
        params: serde_json::Value,
        description: Option<String>,
        snapshot: Option<SnapshotArtifacts>,
    ) -> Result<ActionRecord> {
        let timestamp = now_ms();
        let mut record = ActionRecord {
            index: self.file.actions.len(),
            kind,
            timestamp,
            description,
            params,
            structure: None,
            xpath_map: None,
            screenshot: None,
            list_file: None,
            element_file: None,
        };

        if kind.captures_snapshot() {
            if let Some(snap) = snapshot {
                let structure_name = format!("{timestamp}-structure.txt");
                let xpath_name = format!("{timestamp}-xpath.json");
                std::fs::write(self.data_dir.join(&structure_name), &snap.outline)
                    .map_err(|e| ServiceError::FilesystemError(e.to_string()))?;
                let xpath_json = serde_json::to_string_pretty(&snap.xpath_map)?;
                std::fs::write(self.data_dir.join(&xpath_name), xpath_json)
                    .map_err(|e| ServiceError::FilesystemError(e.to_string()))?;
                record.structure = Some(structure_name);
                record.xpath_map = Some(xpath_name);

                if let Some(png) = snap.screenshot_png {
                    let screenshot_name = format!("{timestamp}-screenshot.png");
                    std::fs::write(self.data_dir.join(&screenshot_name), png)
                        .map_err(|e| ServiceError::FilesystemError(e.to_string()))?;
                    record.screenshot = Some(screenshot_name);
                }
            }
        }

        self.file.actions.push(record.clone());
        write_actions_file(&self.actions_path(), &self.file)?;
        Ok(record)
    }

    /// Write a list-extraction artifact (`<ts>-list.json`) and return its filename.
    pub fn write_list_file(&self, ts: u64, items: &[String]) -> Result<String> {
        let name = format!("{ts}-list.json");
        let json = serde_json::to_string_pretty(items)?;
        std::fs::write(self.data_dir.join(&name), json)
            .map_err(|e| ServiceError::FilesystemError(e.to_string()))?;
        Ok(name)
    }

    /// Write an element-extraction artifact (`<ts>-element.html`) and return its filename.
    pub fn write_element_file(&self, ts: u64, html: &str) -> Result<String> {
        let name = format!("{ts}-element.html");
        std::fs::write(self.data_dir.join(&name), html)
            .map_err(|e| ServiceError::FilesystemError(e.to_string()))?;
        Ok(name)
    }

    /// Write a debug full-page-HTML snapshot (`<ts>-page.html`), served alongside a structure
    /// fetch so a caller inspecting `/structure` can cross-reference the raw DOM. Not part of
    /// the per-action snapshot trio captured by [`Self::append`].
    pub fn write_page_html(&self, ts: u64, html: &str) -> Result<String> {
        let name = format!("{ts}-page.html");
        std::fs::write(self.data_dir.join(&name), html)
            .map_err(|e| ServiceError::FilesystemError(e.to_string()))?;
        Ok(name)
    }

    /// Attach a list-extraction artifact filename to an already-appended record, for actions
    /// (`getListHtml`, `getListHtmlByParent`) whose extra artifact is written after the
    /// standard snapshot trio because it needs the query results the caller (C7) computed.
    pub fn attach_list_file(&mut self, index: usize, file: String) -> Result<()> {
        let record = self
            .file
            .actions
            .get_mut(index)
            .ok_or_else(|| ServiceError::Internal(format!("action index {index} out of range")))?;
        record.list_file = Some(file);
        write_actions_file(&self.actions_path(), &self.file)
    }

    /// Attach an element-extraction artifact filename to an already-appended record.
    pub fn attach_element_file(&mut self, index: usize, file: String) -> Result<()> {
        let record = self
            .file
            .actions
            .get_mut(index)
            .ok_or_else(|| ServiceError::Internal(format!("action index {index} out of range")))?;
        record.element_file = Some(file);
        write_actions_file(&self.actions_path(), &self.file)
    }

    /// Remove an action entry and any artifact files it references. Out-of-range indices
    /// error; missing files are tolerated.
    pub fn delete_action(&mut self, idx: usize) -> Result<()> {
        if idx >= self.file.actions.len() {
            return Err(ServiceError::BadRequest(format!("action index {idx} out of range")));
        }
        let record = self.file.actions.remove(idx);
        for name in [
            &record.screenshot,
            &record.structure,
            &record.xpath_map,
            &record.list_file,
            &record.element_file,
        ]
        .into_iter()
        .flatten()
        {
            let _ = std::fs::remove_file(self.data_dir.join(name));
        }
        write_actions_file(&self.actions_path(), &self.file)?;
        Ok(())
    }

    /// Recursively remove the page's whole recording directory.
    pub fn delete_all(self) -> Result<()> {
        let page_dir = self.page_dir.clone();
        drop(self);
        if page_dir.exists() {
            std::fs::remove_dir_all(&page_dir)
                .map_err(|e| ServiceError::FilesystemError(e.to_string()))?;
        }
        Ok(())
    }

    /// Append one console line: `[ISO8601] [LEVEL] message`, plus an optional stack dump.
    pub async fn write_console_line(&mut self, level: &str, message: &str, stack: Option<&str>) {
        let Some(writer) = self.console_writer.as_mut() else {
            return;
        };
        let ts = format_iso8601(now_ms());
        let mut line = format!("[{ts}] [{level}] {message}\n");
        if let Some(stack) = stack {
            line.push_str(stack);
            line.push('\n');
        }
        if writer.write_all(line.as_bytes()).await.is_err() {
            tracing::warn!("console log write failed, dropping entry");
        }
    }

    pub async fn write_page_error(&mut self, message: &str, stack: Option<&str>) {
        self.write_console_line("PAGE-ERROR", message, stack).await;
    }

    /// Append the terminal `close` action and flush the console stream.
    pub fn record_close(&mut self) -> Result<ActionRecord> {
        self.append(ActionKind::Close, serde_json::json!({}), None, None)
    }
}

fn write_actions_file(path: &Path, file: &ActionsFile) -> Result<()> {
    let content = serde_json::to_string_pretty(file)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, content).map_err(|e| ServiceError::FilesystemError(e.to_string()))?;
    std::fs::rename(&tmp_path, path).map_err(|e| ServiceError::FilesystemError(e.to_string()))?;
    Ok(())
}

/// `YYYY-MM-DDTHH:MM:SS.mmmZ`, UTC, millisecond precision.
const ISO8601_MILLIS: &[time::format_description::FormatItem<'static>] = time::macros::format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
);

fn format_iso8601(epoch_ms: u64) -> String {
    let dt = time::OffsetDateTime::from_unix_timestamp(epoch_ms as i64 / 1000)
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
        + time::Duration::milliseconds((epoch_ms % 1000) as i64);
    dt.format(ISO8601_MILLIS)
        .unwrap_or_else(|_| "1970-01-01T00:00:00.000Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_seeds_actions_file_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let page_dir = dir.path().join("page-1");
        let recorder = Recorder::init(page_dir.clone(), "page-1", "example", None)
            .await
            .unwrap();
        assert!(page_dir.join("actions.json").exists());
        assert!(page_dir.join("data").is_dir());
        assert_eq!(recorder.actions_file().actions.len(), 0);
    }

    #[tokio::test]
    async fn append_without_snapshot_writes_no_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let page_dir = dir.path().join("page-2");
        let mut recorder = Recorder::init(page_dir, "page-2", "example", None)
            .await
            .unwrap();
        let record = recorder
            .append(ActionKind::Create, serde_json::json!({}), None, None)
            .unwrap();
        assert!(record.structure.is_none());
        assert_eq!(recorder.actions_file().actions.len(), 1);
    }

    #[tokio::test]
    async fn append_with_snapshot_writes_structure_and_xpath_files() {
        let dir = tempfile::tempdir().unwrap();
        let page_dir = dir.path().join("page-3");
        let mut recorder = Recorder::init(page_dir, "page-3", "example", None)
            .await
            .unwrap();
        let mut xpath_map = HashMap::new();
        xpath_map.insert("0-1".to_string(), "/html[1]".to_string());
        let record = recorder
            .append(
                ActionKind::Navigate,
                serde_json::json!({"url": "about:blank"}),
                None,
                Some(SnapshotArtifacts {
                    outline: "[0-1] WebArea".to_string(),
                    xpath_map,
                    screenshot_png: None,
                }),
            )
            .unwrap();
        assert!(record.structure.is_some());
        assert!(record.xpath_map.is_some());
        assert!(record.screenshot.is_none());
    }

    #[tokio::test]
    async fn delete_action_removes_artifact_files() {
        let dir = tempfile::tempdir().unwrap();
        let page_dir = dir.path().join("page-4");
        let mut recorder = Recorder::init(page_dir.clone(), "page-4", "example", None)
            .await
            .unwrap();
        let mut xpath_map = HashMap::new();
        xpath_map.insert("0-1".to_string(), "/html[1]".to_string());
        recorder
            .append(
                ActionKind::Navigate,
                serde_json::json!({}),
                None,
                Some(SnapshotArtifacts {
                    outline: "x".to_string(),
                    xpath_map,
                    screenshot_png: None,
                }),
            )
            .unwrap();
        let structure_name = recorder.actions_file().actions[0].structure.clone().unwrap();
        assert!(page_dir.join("data").join(&structure_name).exists());
        recorder.delete_action(0).unwrap();
        assert!(!page_dir.join("data").join(&structure_name).exists());
        assert_eq!(recorder.actions_file().actions.len(), 0);
    }

    #[tokio::test]
    async fn delete_action_out_of_range_errors() {
        let dir = tempfile::tempdir().unwrap();
        let page_dir = dir.path().join("page-5");
        let mut recorder = Recorder::init(page_dir, "page-5", "example", None)
            .await
            .unwrap();
        assert!(recorder.delete_action(0).is_err());
    }

    #[tokio::test]
    async fn delete_all_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let page_dir = dir.path().join("page-6");
        let recorder = Recorder::init(page_dir.clone(), "page-6", "example", None)
            .await
            .unwrap();
        recorder.delete_all().unwrap();
        assert!(!page_dir.exists());
    }

    #[test]
    fn iso8601_formats_epoch() {
        assert_eq!(format_iso8601(0), "1970-01-01T00:00:00.000Z");
    }

    #[tokio::test]
    async fn attach_list_file_persists_on_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let page_dir = dir.path().join("page-7");
        let mut recorder = Recorder::init(page_dir, "page-7", "example", None)
            .await
            .unwrap();
        let record = recorder
            .append(ActionKind::GetListHtml, serde_json::json!({"selector": "//li"}), None, None)
            .unwrap();
        recorder.attach_list_file(record.index, "123-list.json".to_string()).unwrap();
        assert_eq!(
            recorder.actions_file().actions[0].list_file.as_deref(),
            Some("123-list.json")
        );
    }

    #[tokio::test]
    async fn attach_element_file_out_of_range_errors() {
        let dir = tempfile::tempdir().unwrap();
        let page_dir = dir.path().join("page-8");
        let mut recorder = Recorder::init(page_dir, "page-8", "example", None)
            .await
            .unwrap();
        assert!(recorder.attach_element_file(0, "x.html".to_string()).is_err());
    }
}
