//! Driver adapter (C1): a thin, typed interface over one page's CDP session. Generalizes
//! away from raw CDP method strings everywhere else in the codebase so C3–C7 never see a
//! CDP method name directly.

pub mod cdp;
pub mod launch;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, ServiceError};
use cdp::{CdpConnection, CdpEvent};

const HELPER_SCRIPT: &str = r#"
(function() {
  if (window.__simplepage_injected) return;
  window.__simplepage_injected = true;
  window.__simplepage_closed_roots = new Map();
  const origAttach = Element.prototype.attachShadow;
  Element.prototype.attachShadow = function(init) {
    const root = origAttach.call(this, init);
    if (init && init.mode === 'closed') {
      window.__simplepage_closed_roots.set(this, root);
    }
    return root;
  };
  window.__simplepage_get_closed_root = function(host) {
    return window.__simplepage_closed_roots.get(host) || null;
  };
  window.__simplepage_xpath_of = function(el) {
    if (!el || el.nodeType !== 1) return '';
    const segs = [];
    let node = el;
    while (node && node.nodeType === 1) {
      let idx = 1;
      let sib = node.previousElementSibling;
      while (sib) {
        if (sib.tagName === node.tagName) idx++;
        sib = sib.previousElementSibling;
      }
      segs.unshift(node.tagName.toLowerCase() + '[' + idx + ']');
      node = node.parentElement;
    }
    return '/' + segs.join('/');
  };
})();
"#;

/// One page's driver handle: a CDP connection to its own devtools target, plus whatever
/// out-of-process iframe sessions have attached via `Target.setAutoAttach`.
pub struct PageDriver {
    conn: Arc<CdpConnection>,
    pub target_id: String,
    cdp_port: u16,
}

/// A frame in the page's frame tree, as surfaced by `Page.getFrameTree`.
#[derive(Debug, Clone)]
pub struct FrameNode {
    pub frame_id: String,
    pub parent_frame_id: Option<String>,
    pub url: String,
}

impl PageDriver {
    pub async fn connect(target: &Value, cdp_port: u16) -> Result<Self> {
        let ws_url = target
            .get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServiceError::DriverGone("target has no websocket url".to_string()))?;
        let target_id = target
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let conn = CdpConnection::connect(ws_url).await?;
        Ok(Self {
            conn: Arc::new(conn),
            target_id,
            cdp_port,
        })
    }

    /// Enable the domains the rest of the system needs and inject the helper script. Called
    /// exactly once, during page initialization.
    pub async fn init(&self) -> Result<()> {
        self.send("Page.enable", json!({})).await?;
        self.send("Runtime.enable", json!({})).await?;
        self.send("DOM.enable", json!({})).await?;
        self.send("Network.enable", json!({})).await?;
        self.send("Accessibility.enable", json!({})).await?;
        self.send(
            "Target.setAutoAttach",
            json!({ "autoAttach": true, "waitForDebuggerOnStart": false, "flatten": true }),
        )
        .await?;
        self.send(
            "Page.addScriptToEvaluateOnNewDocument",
            json!({ "source": HELPER_SCRIPT }),
        )
        .await?;
        // Also run it once for the already-loaded document (about:blank at this point).
        let _ = self
            .send("Runtime.evaluate", json!({ "expression": HELPER_SCRIPT }))
            .await;
        Ok(())
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<CdpEvent> {
        self.conn.subscribe()
    }

    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.conn.send(method, params).await
    }

    pub async fn send_in_session(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value> {
        self.conn.send_in_session(method, params, session_id).await
    }

    // ---- PageSurface ----

    pub async fn navigate(&self, url: &str, timeout_ms: u64) -> Result<String> {
        let mut rx = self.subscribe_events();
        self.send("Page.navigate", json!({ "url": url })).await?;
        let _ = tokio::time::timeout(Duration::from_millis(timeout_ms), async {
            loop {
                match rx.recv().await {
                    Ok(ev) if ev.method == "Page.loadEventFired" => return,
                    Ok(_) => continue,
                    Err(_) => return,
                }
            }
        })
        .await;
        self.url().await
    }

    pub async fn back(&self) -> Result<()> {
        self.evaluate("history.back()").await.map(|_| ())
    }

    pub async fn forward(&self) -> Result<()> {
        self.evaluate("history.forward()").await.map(|_| ())
    }

    pub async fn reload(&self, timeout_ms: u64) -> Result<String> {
        let mut rx = self.subscribe_events();
        self.send("Page.reload", json!({ "ignoreCache": false }))
            .await?;
        let _ = tokio::time::timeout(Duration::from_millis(timeout_ms), async {
            loop {
                match rx.recv().await {
                    Ok(ev) if ev.method == "Page.loadEventFired" => return,
                    Ok(_) => continue,
                    Err(_) => return,
                }
            }
        })
        .await;
        self.url().await
    }

    pub async fn title(&self) -> Result<String> {
        let v = self.evaluate("document.title").await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    pub async fn url(&self) -> Result<String> {
        let v = self.evaluate("location.href").await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    pub async fn content(&self) -> Result<String> {
        let v = self.evaluate("document.documentElement.outerHTML").await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    pub async fn screenshot(&self) -> Result<Vec<u8>> {
        let result = self
            .send("Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        let data = result
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServiceError::Internal("no screenshot data".to_string()))?;
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data)
            .map_err(|e| ServiceError::Internal(format!("bad screenshot base64: {e}")))
    }

    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .send(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true, "awaitPromise": true }),
            )
            .await?;
        if let Some(exc) = result.get("exceptionDetails") {
            let msg = exc
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(|v| v.as_str())
                .unwrap_or("evaluation threw");
            return Err(ServiceError::Internal(format!("js exception: {msg}")));
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub async fn get_frame_tree(&self) -> Result<Vec<FrameNode>> {
        let result = self.send("Page.getFrameTree", json!({})).await?;
        let mut out = Vec::new();
        collect_frames(&result.get("frameTree").cloned().unwrap_or(Value::Null), &mut out);
        Ok(out)
    }

    /// Raw `Accessibility.getFullAXTree` nodes for the root session.
    pub async fn get_full_ax_tree(&self) -> Result<Vec<Value>> {
        let result = self
            .send("Accessibility.getFullAXTree", json!({}))
            .await
            .map_err(|e| ServiceError::AxExtractionFailed(e.to_string()))?;
        Ok(result
            .get("nodes")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    // ---- xpath-targeted locator surface ----

    /// Resolve an xpath to a CDP `objectId` for the first matching element.
    async fn resolve_xpath_object_id(&self, xpath: &str) -> Result<String> {
        let node_id = self.resolve_xpath_node_id(xpath).await?;
        let result = self
            .send("DOM.resolveNode", json!({ "nodeId": node_id }))
            .await?;
        result
            .get("object")
            .and_then(|o| o.get("objectId"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ServiceError::ElementNotFound(xpath.to_string()))
    }

    async fn resolve_xpath_node_id(&self, xpath: &str) -> Result<i64> {
        self.send("DOM.getDocument", json!({ "depth": -1, "pierce": true }))
            .await?;
        let search = self
            .send("DOM.performSearch", json!({ "query": xpath }))
            .await?;
        let search_id = search
            .get("searchId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServiceError::InvalidSelector(xpath.to_string()))?;
        let count = search
            .get("resultCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        if count == 0 {
            let _ = self
                .send("DOM.discardSearchResults", json!({ "searchId": search_id }))
                .await;
            return Err(ServiceError::ElementNotFound(xpath.to_string()));
        }
        let results = self
            .send(
                "DOM.getSearchResults",
                json!({ "searchId": search_id, "fromIndex": 0, "toIndex": 1 }),
            )
            .await?;
        let _ = self
            .send("DOM.discardSearchResults", json!({ "searchId": search_id }))
            .await;
        results
            .get("nodeIds")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ServiceError::ElementNotFound(xpath.to_string()))
    }

    /// Resolve `query` to every matching element's backend node id. `DOM.performSearch`
    /// accepts plain text, a CSS selector, or an XPath expression interchangeably, so callers
    /// never need to distinguish the selector dialect before reaching the driver.
    pub async fn query_all_node_ids(&self, query: &str) -> Result<Vec<i64>> {
        self.send("DOM.getDocument", json!({ "depth": -1, "pierce": true }))
            .await?;
        let search = self.send("DOM.performSearch", json!({ "query": query })).await?;
        let search_id = search
            .get("searchId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServiceError::InvalidSelector(query.to_string()))?;
        let count = search
            .get("resultCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        if count == 0 {
            let _ = self
                .send("DOM.discardSearchResults", json!({ "searchId": search_id }))
                .await;
            return Ok(Vec::new());
        }
        let results = self
            .send(
                "DOM.getSearchResults",
                json!({ "searchId": search_id, "fromIndex": 0, "toIndex": count }),
            )
            .await?;
        let _ = self
            .send("DOM.discardSearchResults", json!({ "searchId": search_id }))
            .await;
        Ok(results
            .get("nodeIds")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.as_i64())
            .collect())
    }

    /// Same resolution `act-xpath`/`act-id` use under the hood, exposed for callers (list/
    /// element extraction) that only need the first match.
    pub async fn first_node_id(&self, query: &str) -> Result<i64> {
        self.resolve_xpath_node_id(query).await
    }

    /// Like [`Self::first_node_id`], but returns the AX-tree-comparable `backendNodeId`
    /// rather than the frontend `DOM.nodeId` — the id C3's encoded ids and scope restriction
    /// are keyed on.
    pub async fn first_backend_node_id(&self, query: &str) -> Result<i64> {
        let node_id = self.resolve_xpath_node_id(query).await?;
        let described = self
            .send("DOM.describeNode", json!({ "nodeId": node_id }))
            .await?;
        described
            .get("node")
            .and_then(|n| n.get("backendNodeId"))
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ServiceError::Internal("describeNode returned no backendNodeId".to_string()))
    }

    async fn object_id_for_node_id(&self, node_id: i64) -> Result<String> {
        let result = self
            .send("DOM.resolveNode", json!({ "nodeId": node_id }))
            .await?;
        result
            .get("object")
            .and_then(|o| o.get("objectId"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ServiceError::Internal("node has no objectId".to_string()))
    }

    /// `outerHTML` of the element at `node_id`.
    pub async fn outer_html_for_node_id(&self, node_id: i64) -> Result<String> {
        let object_id = self.object_id_for_node_id(node_id).await?;
        let result = self
            .send(
                "Runtime.callFunctionOn",
                json!({
                    "functionDeclaration": "function(){return this.outerHTML;}",
                    "objectId": object_id,
                    "returnByValue": true,
                }),
            )
            .await?;
        result
            .get("result")
            .and_then(|r| r.get("value"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ServiceError::ElementNotFound(format!("node {node_id}")))
    }

    /// `outerHTML` of each direct element child of the element at `node_id`, in document
    /// order — the building block for `getListHtmlByParent`.
    pub async fn children_outer_html_for_node_id(&self, node_id: i64) -> Result<Vec<String>> {
        let object_id = self.object_id_for_node_id(node_id).await?;
        let result = self
            .send(
                "Runtime.callFunctionOn",
                json!({
                    "functionDeclaration": "function(){return Array.from(this.children).map(function(c){return c.outerHTML;});}",
                    "objectId": object_id,
                    "returnByValue": true,
                }),
            )
            .await?;
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect())
    }

    async fn call_on_xpath(&self, xpath: &str, function_declaration: &str, args: Vec<Value>) -> Result<Value> {
        let object_id = self.resolve_xpath_object_id(xpath).await?;
        let arguments: Vec<Value> = args
            .into_iter()
            .map(|v| json!({ "value": v }))
            .collect();
        let result = self
            .send(
                "Runtime.callFunctionOn",
                json!({
                    "functionDeclaration": function_declaration,
                    "objectId": object_id,
                    "arguments": arguments,
                    "returnByValue": true,
                }),
            )
            .await?;
        if let Some(exc) = result.get("exceptionDetails") {
            let msg = exc
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(|v| v.as_str())
                .unwrap_or("call threw");
            return Err(ServiceError::Internal(msg.to_string()));
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn bounding_rect(&self, xpath: &str) -> Result<(f64, f64)> {
        let v = self
            .call_on_xpath(
                xpath,
                "function(){const r=this.getBoundingClientRect();return {x:r.x+r.width/2,y:r.y+r.height/2};}",
                vec![],
            )
            .await?;
        let x = v.get("x").and_then(|n| n.as_f64()).unwrap_or(0.0);
        let y = v.get("y").and_then(|n| n.as_f64()).unwrap_or(0.0);
        Ok((x, y))
    }

    /// `click({force:true})`: dispatch real mouse events at the element's center, bypassing
    /// visibility/actionability checks the way a forced click does.
    pub async fn click_xpath(&self, xpath: &str) -> Result<()> {
        self.call_on_xpath(xpath, "function(){this.scrollIntoView({block:'center'});}", vec![])
            .await?;
        let (x, y) = self.bounding_rect(xpath).await?;
        self.send(
            "Input.dispatchMouseEvent",
            json!({ "type": "mouseMoved", "x": x, "y": y }),
        )
        .await?;
        self.send(
            "Input.dispatchMouseEvent",
            json!({ "type": "mousePressed", "x": x, "y": y, "button": "left", "clickCount": 1 }),
        )
        .await?;
        self.send(
            "Input.dispatchMouseEvent",
            json!({ "type": "mouseReleased", "x": x, "y": y, "button": "left", "clickCount": 1 }),
        )
        .await?;
        Ok(())
    }

    pub async fn hover_xpath(&self, xpath: &str) -> Result<()> {
        let (x, y) = self.bounding_rect(xpath).await?;
        self.send(
            "Input.dispatchMouseEvent",
            json!({ "type": "mouseMoved", "x": x, "y": y }),
        )
        .await?;
        Ok(())
    }

    pub async fn fill_xpath(&self, xpath: &str, text: &str) -> Result<()> {
        self.call_on_xpath(
            xpath,
            "function(v){this.focus();this.value=v;this.dispatchEvent(new Event('input',{bubbles:true}));this.dispatchEvent(new Event('change',{bubbles:true}));}",
            vec![json!(text)],
        )
        .await?;
        Ok(())
    }

    pub async fn select_option_xpath(&self, xpath: &str, value: &str) -> Result<()> {
        self.call_on_xpath(
            xpath,
            "function(v){this.value=v;this.dispatchEvent(new Event('change',{bubbles:true}));}",
            vec![json!(value)],
        )
        .await?;
        Ok(())
    }

    pub async fn set_checked_xpath(&self, xpath: &str, checked: bool) -> Result<()> {
        self.call_on_xpath(
            xpath,
            "function(c){this.checked=c;this.dispatchEvent(new Event('change',{bubbles:true}));}",
            vec![json!(checked)],
        )
        .await?;
        Ok(())
    }

    pub async fn press_key_xpath(&self, xpath: &str, key: &str) -> Result<()> {
        self.call_on_xpath(xpath, "function(){this.focus();}", vec![])
            .await?;
        self.send(
            "Input.dispatchKeyEvent",
            json!({ "type": "keyDown", "key": key }),
        )
        .await?;
        self.send(
            "Input.dispatchKeyEvent",
            json!({ "type": "keyUp", "key": key }),
        )
        .await?;
        Ok(())
    }

    pub async fn scroll_xpath(&self, xpath: &str, axis: ScrollAxis, arg: &str) -> Result<()> {
        let js = scroll_script(axis, arg);
        self.call_on_xpath(xpath, &js, vec![]).await?;
        Ok(())
    }

    pub async fn set_input_files_xpath(&self, xpath: &str, paths: &[String]) -> Result<()> {
        let node_id = self.resolve_xpath_node_id(xpath).await?;
        self.send(
            "DOM.setFileInputFiles",
            json!({ "files": paths, "nodeId": node_id }),
        )
        .await?;
        Ok(())
    }

    /// Attach a one-shot dialog handler, click the locator to trigger it, and resolve the
    /// dialog. Fails with `DialogNotFired` if no dialog surfaces before `timeout_ms`.
    pub async fn handle_dialog_xpath(
        &self,
        xpath: &str,
        accept: bool,
        prompt_text: Option<&str>,
        timeout_ms: u64,
    ) -> Result<()> {
        let mut rx = self.subscribe_events();
        self.click_xpath(xpath).await?;
        let fired = tokio::time::timeout(Duration::from_millis(timeout_ms), async {
            loop {
                match rx.recv().await {
                    Ok(ev) if ev.method == "Page.javascriptDialogOpening" => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        })
        .await
        .unwrap_or(false);

        if !fired {
            return Err(ServiceError::DialogNotFired);
        }

        let mut params = json!({ "accept": accept });
        if let Some(text) = prompt_text {
            params["promptText"] = json!(text);
        }
        self.send("Page.handleJavaScriptDialog", params).await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        cdp::close_page_target(self.cdp_port, &self.target_id).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollAxis {
    Y,
    X,
}

fn scroll_script(axis: ScrollAxis, arg: &str) -> String {
    let (prop_size, prop_scroll, window_scroll_prop) = match axis {
        ScrollAxis::Y => ("scrollHeight", "scrollTop", "scrollY"),
        ScrollAxis::X => ("scrollWidth", "scrollLeft", "scrollX"),
    };
    let current = format!(
        "(this===document.body||this===document.documentElement?window.{window_scroll_prop}:this.{prop_scroll})"
    );
    let target = match arg {
        "top" | "left" => "0".to_string(),
        "bottom" | "right" => format!("this===document.body?document.documentElement.{prop_size}:this.{prop_size}"),
        other => match other.parse::<i64>() {
            // Positive deltas scroll relative to the current position; negative values are
            // treated as an absolute offset from the top/left edge.
            Ok(n) if n >= 0 => format!("{current}+{n}"),
            Ok(n) => format!("{}", n.unsigned_abs()),
            Err(_) => "0".to_string(),
        },
    };
    match axis {
        ScrollAxis::Y => format!(
            "function(){{const t=({target});if(this===document.body||this===document.documentElement){{window.scrollTo(window.scrollX,t);}}else{{this.scrollTop=t;}}}}"
        ),
        ScrollAxis::X => format!(
            "function(){{const t=({target});if(this===document.body||this===document.documentElement){{window.scrollTo(t,window.scrollY);}}else{{this.scrollLeft=t;}}}}"
        ),
    }
}

fn collect_frames(tree: &Value, out: &mut Vec<FrameNode>) {
    let Some(frame) = tree.get("frame") else { return };
    let frame_id = frame
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let parent_frame_id = frame
        .get("parentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let url = frame
        .get("url")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    out.push(FrameNode {
        frame_id,
        parent_frame_id,
        url,
    });
    if let Some(children) = tree.get("childFrames").and_then(|v| v.as_array()) {
        for child in children {
            collect_frames(child, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scroll_script_top_zeroes() {
        let js = scroll_script(ScrollAxis::Y, "top");
        assert!(js.contains("(0)"));
    }

    #[test]
    fn scroll_script_negative_is_absolute() {
        let js = scroll_script(ScrollAxis::Y, "-40");
        assert!(js.contains("(40)"));
    }

    #[test]
    fn collect_frames_walks_children() {
        let tree = json!({
            "frame": {"id": "top", "url": "https://a"},
            "childFrames": [
                {"frame": {"id": "child", "parentId": "top", "url": "https://b"}}
            ]
        });
        let mut out = Vec::new();
        collect_frames(&tree, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].frame_id, "top");
        assert_eq!(out[1].parent_frame_id.as_deref(), Some("top"));
    }
}
