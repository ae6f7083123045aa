//! Replay driver (C9): walks a recorded action trace and re-issues it against a fresh,
//! non-recording page, in-process against the same [`PageManager`] rather than over HTTP.

use serde::{Deserialize, Serialize};

use crate::actions::{ActionMethod, ActionRequest, Target};
use crate::error::ServiceError;
use crate::page_manager::PageManager;
use crate::recorder::{ActionKind, ActionRecord};

fn default_delay_ms() -> u64 {
    0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayOptions {
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub verbose: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            continue_on_error: false,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayErrorEntry {
    pub index: usize,
    pub kind: ActionKind,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    pub executed_actions: usize,
    pub errors: Vec<ReplayErrorEntry>,
}

/// Replay `actions` in order against a newly created, non-recording page. The page is closed
/// best-effort on exit, whether replay succeeded, errored, or was stopped early.
pub async fn replay(manager: &PageManager, actions: &[ActionRecord], options: ReplayOptions) -> ReplayResult {
    let mut executed = 0usize;
    let mut errors = Vec::new();
    let mut page_id: Option<String> = None;

    for (i, record) in actions.iter().enumerate() {
        if options.verbose {
            tracing::info!(index = i, kind = ?record.kind, "replaying action");
        }

        let outcome = replay_one(manager, &mut page_id, record).await;
        match outcome {
            Ok(true) => executed += 1,
            Ok(false) => {
                tracing::warn!(index = i, kind = ?record.kind, "replay skipped unsupported action kind");
            }
            Err(e) => {
                errors.push(ReplayErrorEntry {
                    index: i,
                    kind: record.kind,
                    error: e.to_string(),
                });
                if !options.continue_on_error {
                    break;
                }
            }
        }

        if options.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(options.delay_ms)).await;
        }
    }

    if let Some(id) = page_id {
        let _ = manager.close_page(&id).await;
    }

    ReplayResult {
        executed_actions: executed,
        errors,
    }
}

/// Dispatch one record. Returns `Ok(true)` on a supported, executed kind, `Ok(false)` for a
/// kind replay deliberately skips (logged, not an error).
async fn replay_one(
    manager: &PageManager,
    page_id: &mut Option<String>,
    record: &ActionRecord,
) -> Result<bool, ServiceError> {
    match record.kind {
        ActionKind::Create => {
            let name = record
                .params
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("replay")
                .to_string();
            let url = record
                .params
                .get("url")
                .and_then(|v| v.as_str())
                .unwrap_or("about:blank");
            let info = manager.create_page(name, url, None, None, false).await?;
            *page_id = Some(info.id);
            Ok(true)
        }
        ActionKind::Navigate => {
            let id = current_page(page_id)?;
            let url = record
                .params
                .get("url")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ServiceError::BadRequest("navigate record missing url".to_string()))?;
            manager.navigate(id, url, None, None).await?;
            Ok(true)
        }
        ActionKind::NavigateBack => {
            manager.navigate_back(current_page(page_id)?, None).await?;
            Ok(true)
        }
        ActionKind::NavigateForward => {
            manager.navigate_forward(current_page(page_id)?, None).await?;
            Ok(true)
        }
        ActionKind::Reload => {
            manager.reload(current_page(page_id)?, None).await?;
            Ok(true)
        }
        ActionKind::Wait => {
            let id = current_page(page_id)?;
            let timeout_ms = record
                .params
                .get("timeout")
                .and_then(|v| v.as_u64())
                .unwrap_or(30_000);
            manager.wait(id, timeout_ms, None).await?;
            Ok(true)
        }
        ActionKind::Condition => {
            let id = current_page(page_id)?;
            let pattern = record
                .params
                .get("pattern")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ServiceError::BadRequest("condition record missing pattern".to_string()))?;
            manager.condition(id, pattern, None, None).await?;
            Ok(true)
        }
        ActionKind::Act => {
            let id = current_page(page_id)?;
            let req = action_request_from_record(record)?;
            manager.act(id, req).await?;
            Ok(true)
        }
        ActionKind::GetListHtml => {
            let id = current_page(page_id)?;
            let selector = record
                .params
                .get("selector")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ServiceError::BadRequest("getListHtml record missing selector".to_string()))?;
            manager.get_list_html(id, selector, None).await?;
            Ok(true)
        }
        ActionKind::GetListHtmlByParent => {
            let id = current_page(page_id)?;
            let selector = record
                .params
                .get("selector")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ServiceError::BadRequest("getListHtmlByParent record missing selector".to_string()))?;
            manager.get_list_html_by_parent(id, selector, None).await?;
            Ok(true)
        }
        ActionKind::GetElementHtml => {
            let id = current_page(page_id)?;
            let selector = record
                .params
                .get("selector")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ServiceError::BadRequest("getElementHtml record missing selector".to_string()))?;
            manager.get_element_html(id, selector, None).await?;
            Ok(true)
        }
        ActionKind::Close => {
            if let Some(id) = page_id.take() {
                manager.close_page(&id).await?;
            }
            Ok(true)
        }
    }
}

fn current_page<'a>(page_id: &'a Option<String>) -> Result<&'a str, ServiceError> {
    page_id
        .as_deref()
        .ok_or_else(|| ServiceError::BadRequest("replay action before a create".to_string()))
}

/// Prefer xpath over encoded id when both are present, per replay's documented policy.
fn action_request_from_record(record: &ActionRecord) -> Result<ActionRequest, ServiceError> {
    let method_str = record
        .params
        .get("method")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ServiceError::BadRequest("act record missing method".to_string()))?;
    let method: ActionMethod = method_str.parse()?;

    let target = if let Some(xp) = record.params.get("xpath").and_then(|v| v.as_str()) {
        Target::Xpath(xp.to_string())
    } else if let Some(id) = record.params.get("encodedId").and_then(|v| v.as_str()) {
        Target::EncodedId(id.to_string())
    } else {
        return Err(ServiceError::BadRequest(
            "act record has neither xpath nor encodedId".to_string(),
        ));
    };

    let args = record
        .params
        .get("args")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    Ok(ActionRequest {
        target,
        method,
        args,
        description: record.description.clone(),
        settle_timeout_ms: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_page_fails_before_create() {
        let page_id: Option<String> = None;
        assert!(current_page(&page_id).is_err());
    }

    #[test]
    fn action_request_prefers_xpath_over_encoded_id() {
        let record = ActionRecord {
            index: 0,
            kind: ActionKind::Act,
            timestamp: 0,
            description: None,
            params: serde_json::json!({
                "method": "click",
                "args": [],
                "xpath": "//button",
                "encodedId": "0-1",
            }),
            structure: None,
            xpath_map: None,
            screenshot: None,
            list_file: None,
            element_file: None,
        };
        let req = action_request_from_record(&record).unwrap();
        assert!(matches!(req.target, Target::Xpath(ref xp) if xp == "//button"));
    }

    #[test]
    fn action_request_rejects_missing_target() {
        let record = ActionRecord {
            index: 0,
            kind: ActionKind::Act,
            timestamp: 0,
            description: None,
            params: serde_json::json!({"method": "click", "args": []}),
            structure: None,
            xpath_map: None,
            screenshot: None,
            list_file: None,
            element_file: None,
        };
        assert!(action_request_from_record(&record).is_err());
    }

    #[test]
    fn default_options_do_not_continue_on_error() {
        let options = ReplayOptions::default();
        assert!(!options.continue_on_error);
        assert_eq!(options.delay_ms, 0);
    }
}
