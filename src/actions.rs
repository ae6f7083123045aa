//! Action executor (C5): resolves a target (xpath or encoded id) against a method taxonomy,
//! dispatches to the driver, then awaits quiescence before the caller (C7) records the result.

use std::collections::HashMap;
use std::str::FromStr;

use crate::driver::{PageDriver, ScrollAxis};
use crate::error::{Result, ServiceError};
use crate::quiescence;

const DEFAULT_SETTLE_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionMethod {
    Click,
    Fill,
    SelectOption,
    Check,
    Uncheck,
    Hover,
    Press,
    ScrollY,
    ScrollX,
    HandleDialog,
    FileUpload,
}

impl ActionMethod {
    /// The wire-format method name, as accepted by `act-xpath`/`act-id` and persisted in a
    /// recorded action's params so replay can parse it straight back with [`FromStr`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Fill => "fill",
            Self::SelectOption => "selectOption",
            Self::Check => "check",
            Self::Uncheck => "uncheck",
            Self::Hover => "hover",
            Self::Press => "press",
            Self::ScrollY => "scrollY",
            Self::ScrollX => "scrollX",
            Self::HandleDialog => "handleDialog",
            Self::FileUpload => "fileUpload",
        }
    }
}

impl FromStr for ActionMethod {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "click" => Self::Click,
            "fill" => Self::Fill,
            "selectOption" => Self::SelectOption,
            "check" => Self::Check,
            "uncheck" => Self::Uncheck,
            "hover" => Self::Hover,
            "press" => Self::Press,
            "scrollY" => Self::ScrollY,
            "scrollX" => Self::ScrollX,
            "handleDialog" => Self::HandleDialog,
            "fileUpload" => Self::FileUpload,
            other => return Err(ServiceError::UnsupportedMethod(other.to_string())),
        })
    }
}

/// Either form a caller may address an element by.
#[derive(Debug, Clone)]
pub enum Target {
    Xpath(String),
    EncodedId(String),
}

#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub target: Target,
    pub method: ActionMethod,
    pub args: Vec<serde_json::Value>,
    pub description: Option<String>,
    pub settle_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub success: bool,
}

/// Resolve `target` to an xpath, consulting the page's cached xpath map for encoded ids.
fn resolve_target(target: &Target, cached_xpath_map: Option<&HashMap<String, String>>) -> Result<String> {
    match target {
        Target::Xpath(xp) => Ok(xp.clone()),
        Target::EncodedId(id) => {
            let map = cached_xpath_map
                .ok_or_else(|| ServiceError::XPathMapNotCached(id.clone()))?;
            map.get(id)
                .cloned()
                .ok_or_else(|| ServiceError::NoXPathForEncodedId(id.clone()))
        }
    }
}

fn arg_str(args: &[serde_json::Value], idx: usize) -> Result<String> {
    args.get(idx)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ServiceError::BadRequest(format!("missing or non-string arg at position {idx}")))
}

fn arg_str_array(args: &[serde_json::Value]) -> Result<Vec<String>> {
    args.iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| ServiceError::BadRequest("fileUpload args must all be strings".to_string()))
        })
        .collect()
}

/// Execute one action: resolve target, dispatch the driver call, await settle. Does not
/// itself touch the recorder; callers (C7) are responsible for the pre-snapshot and append.
pub async fn execute(
    driver: &PageDriver,
    cached_xpath_map: Option<&HashMap<String, String>>,
    req: &ActionRequest,
) -> Result<ActionOutcome> {
    let xpath = resolve_target(&req.target, cached_xpath_map)?;

    match req.method {
        ActionMethod::Click => driver.click_xpath(&xpath).await?,
        ActionMethod::Fill => {
            let text = arg_str(&req.args, 0)?;
            driver.fill_xpath(&xpath, &text).await?
        }
        ActionMethod::SelectOption => {
            let value = arg_str(&req.args, 0)?;
            driver.select_option_xpath(&xpath, &value).await?
        }
        ActionMethod::Check => driver.set_checked_xpath(&xpath, true).await?,
        ActionMethod::Uncheck => driver.set_checked_xpath(&xpath, false).await?,
        ActionMethod::Hover => driver.hover_xpath(&xpath).await?,
        ActionMethod::Press => {
            let key = arg_str(&req.args, 0)?;
            driver.press_key_xpath(&xpath, &key).await?
        }
        ActionMethod::ScrollY => {
            let arg = arg_str(&req.args, 0)?;
            driver.scroll_xpath(&xpath, ScrollAxis::Y, &arg).await?
        }
        ActionMethod::ScrollX => {
            let arg = arg_str(&req.args, 0)?;
            driver.scroll_xpath(&xpath, ScrollAxis::X, &arg).await?
        }
        ActionMethod::HandleDialog => {
            let mode = arg_str(&req.args, 0)?;
            let accept = match mode.as_str() {
                "accept" => true,
                "dismiss" => false,
                other => {
                    return Err(ServiceError::BadRequest(format!(
                        "handleDialog arg must be accept|dismiss, got {other}"
                    )))
                }
            };
            let prompt_text = req.args.get(1).and_then(|v| v.as_str());
            let settle_timeout = req.settle_timeout_ms.unwrap_or(DEFAULT_SETTLE_TIMEOUT_MS);
            driver
                .handle_dialog_xpath(&xpath, accept, prompt_text, settle_timeout)
                .await?
        }
        ActionMethod::FileUpload => {
            let paths = arg_str_array(&req.args)?;
            driver.set_input_files_xpath(&xpath, &paths).await?
        }
    }

    let settle_timeout = req.settle_timeout_ms.unwrap_or(DEFAULT_SETTLE_TIMEOUT_MS);
    quiescence::wait_for_settled(driver.subscribe_events(), Some(settle_timeout)).await;

    Ok(ActionOutcome { success: true })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_methods() {
        assert_eq!(ActionMethod::from_str("click").unwrap(), ActionMethod::Click);
        assert_eq!(
            ActionMethod::from_str("handleDialog").unwrap(),
            ActionMethod::HandleDialog
        );
    }

    #[test]
    fn as_str_round_trips_through_from_str() {
        for method in [
            ActionMethod::Click,
            ActionMethod::Fill,
            ActionMethod::SelectOption,
            ActionMethod::Check,
            ActionMethod::Uncheck,
            ActionMethod::Hover,
            ActionMethod::Press,
            ActionMethod::ScrollY,
            ActionMethod::ScrollX,
            ActionMethod::HandleDialog,
            ActionMethod::FileUpload,
        ] {
            assert_eq!(ActionMethod::from_str(method.as_str()).unwrap(), method);
        }
    }

    #[test]
    fn unknown_method_is_unsupported() {
        let err = ActionMethod::from_str("teleport").unwrap_err();
        assert!(matches!(err, ServiceError::UnsupportedMethod(_)));
    }

    #[test]
    fn xpath_target_resolves_to_itself() {
        let resolved = resolve_target(&Target::Xpath("//div".to_string()), None).unwrap();
        assert_eq!(resolved, "//div");
    }

    #[test]
    fn encoded_id_without_cached_map_fails() {
        let err = resolve_target(&Target::EncodedId("0-1".to_string()), None).unwrap_err();
        assert!(matches!(err, ServiceError::XPathMapNotCached(_)));
    }

    #[test]
    fn encoded_id_not_in_map_fails() {
        let map = HashMap::new();
        let err = resolve_target(&Target::EncodedId("0-1".to_string()), Some(&map)).unwrap_err();
        assert!(matches!(err, ServiceError::NoXPathForEncodedId(_)));
    }

    #[test]
    fn encoded_id_resolves_from_map() {
        let mut map = HashMap::new();
        map.insert("0-1".to_string(), "/html[1]/body[1]".to_string());
        let resolved = resolve_target(&Target::EncodedId("0-1".to_string()), Some(&map)).unwrap();
        assert_eq!(resolved, "/html[1]/body[1]");
    }

    #[test]
    fn file_upload_args_must_be_strings() {
        let args = vec![serde_json::json!("a.png"), serde_json::json!(1)];
        assert!(arg_str_array(&args).is_err());
    }
}
