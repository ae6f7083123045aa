//! Accessibility-view builder (C3): turns one page's raw accessibility tree plus DOM
//! metadata into a deterministic outline, an encodedId→xpath map, and an id→URL map.

use serde_json::Value;
use std::collections::HashMap;

use crate::driver::PageDriver;
use crate::error::{Result, ServiceError};
use crate::frame_registry::FrameRegistry;

#[derive(Debug, Clone)]
pub struct AxNode {
    pub role: String,
    pub name: String,
    pub value: Option<String>,
    pub description: Option<String>,
    pub encoded_id: String,
    pub backend_node_id: i64,
    pub frame_ordinal: u32,
    pub children: Vec<AxNode>,
}

#[derive(Debug, Clone, Default)]
pub struct AxView {
    pub simplified: String,
    pub xpath_map: HashMap<String, String>,
    pub id_to_url: HashMap<String, String>,
}

const LANDMARK_ROLES: &[&str] = &[
    "banner", "complementary", "contentinfo", "form", "main", "navigation", "region", "search",
];

const URL_ROLES: &[&str] = &["link", "image", "img", "video", "audio"];

/// Raw, pre-fold AX node as parsed straight from CDP's `Accessibility.getFullAXTree` shape.
struct RawAxNode {
    ax_id: String,
    role: String,
    name: String,
    description: Option<String>,
    value: Option<String>,
    backend_node_id: Option<i64>,
    child_ax_ids: Vec<String>,
    ignored: bool,
}

fn parse_raw_nodes(nodes: &[Value]) -> HashMap<String, RawAxNode> {
    let mut table = HashMap::new();
    for n in nodes {
        let ax_id = n
            .get("nodeId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if ax_id.is_empty() {
            continue;
        }
        let role = n
            .get("role")
            .and_then(|r| r.get("value"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let name = normalize_text(
            n.get("name")
                .and_then(|v| v.get("value"))
                .and_then(|v| v.as_str())
                .unwrap_or_default(),
        );
        let description = n
            .get("description")
            .and_then(|d| d.get("value"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(normalize_text);
        let value = n
            .get("value")
            .and_then(|v| v.get("value"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let backend_node_id = n.get("backendDOMNodeId").and_then(|v| v.as_i64());
        let ignored = n.get("ignored").and_then(|v| v.as_bool()).unwrap_or(false);
        let child_ax_ids = n
            .get("childIds")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        table.insert(
            ax_id.clone(),
            RawAxNode {
                ax_id,
                role,
                name,
                description,
                value,
                backend_node_id,
                child_ax_ids,
                ignored,
            },
        );
    }
    table
}

fn normalize_text(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_control() || *c == ' ')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the accessibility view for the top frame plus any attached out-of-process iframe
/// sessions (keyed by frame id → CDP `sessionId`).
pub async fn build(
    driver: &PageDriver,
    attached_sessions: &HashMap<String, String>,
    registry: &mut FrameRegistry,
    scope_selector: Option<&str>,
) -> Result<AxView> {
    // Gather (frame_id, session_id) pairs: root first, then attached oopif sessions.
    let frame_tree = driver.get_frame_tree().await.unwrap_or_default();
    let top_frame_id = frame_tree
        .iter()
        .find(|f| f.parent_frame_id.is_none())
        .map(|f| f.frame_id.clone());

    let mut sessions: Vec<(Option<String>, Option<String>)> = vec![(top_frame_id.clone(), None)];
    for (frame_id, session_id) in attached_sessions {
        sessions.push((Some(frame_id.clone()), Some(session_id.clone())));
    }

    let mut forest: Vec<AxNode> = Vec::new();
    let mut any_ok = false;

    for (frame_id, session_id) in &sessions {
        let raw = driver
            .send_in_session(
                "Accessibility.getFullAXTree",
                serde_json::json!({}),
                session_id.as_deref(),
            )
            .await;
        let raw = match raw {
            Ok(v) => v,
            Err(e) => {
                if frame_id == &top_frame_id {
                    return Err(ServiceError::AxExtractionFailed(e.to_string()));
                }
                tracing::warn!(?frame_id, error = %e, "skipping unreachable iframe session");
                continue;
            }
        };
        let nodes = raw
            .get("nodes")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let table = parse_raw_nodes(&nodes);
        let ordinal = registry.ordinal(frame_id.as_deref());
        if let Some(root_id) = find_root(&table) {
            if let Some(tree) = build_tree(&table, &root_id, ordinal) {
                forest.push(tree);
                any_ok = true;
            }
        }
    }

    if !any_ok {
        return Err(ServiceError::AxExtractionFailed(
            "no accessible frame produced a tree".to_string(),
        ));
    }

    let folded: Vec<AxNode> = forest.into_iter().filter_map(fold).collect();

    let scoped = match scope_selector {
        Some(sel) => match resolve_scope(driver, &folded, sel).await {
            Some(root) => vec![root],
            None => {
                tracing::warn!(selector = sel, "scope selector not found, using full tree");
                folded
            }
        },
        None => folded,
    };

    let mut xpath_map = HashMap::new();
    let mut id_to_url = HashMap::new();
    for root in &scoped {
        collect_xpaths(driver, root, &mut xpath_map).await;
        collect_urls(driver, root, &mut id_to_url).await;
    }

    let mut simplified = String::new();
    for root in &scoped {
        render(root, 0, &mut simplified);
    }

    Ok(AxView {
        simplified,
        xpath_map,
        id_to_url,
    })
}

fn find_root(table: &HashMap<String, RawAxNode>) -> Option<String> {
    let referenced: std::collections::HashSet<&str> = table
        .values()
        .flat_map(|n| n.child_ax_ids.iter().map(|s| s.as_str()))
        .collect();
    table
        .keys()
        .find(|k| !referenced.contains(k.as_str()))
        .cloned()
        .or_else(|| table.keys().next().cloned())
}

fn build_tree(table: &HashMap<String, RawAxNode>, ax_id: &str, ordinal: u32) -> Option<AxNode> {
    let raw = table.get(ax_id)?;
    if raw.ignored {
        return None;
    }
    let backend_node_id = raw.backend_node_id.unwrap_or(-1);
    let encoded_id = format!("{}-{}", ordinal, backend_node_id);
    let children: Vec<AxNode> = raw
        .child_ax_ids
        .iter()
        .filter_map(|cid| build_tree(table, cid, ordinal))
        .collect();
    Some(AxNode {
        role: raw.role.clone(),
        name: raw.name.clone(),
        value: raw.value.clone(),
        description: raw.description.clone(),
        encoded_id,
        backend_node_id,
        frame_ordinal: ordinal,
        children,
    })
}

fn is_foldable_candidate(node: &AxNode) -> bool {
    let role_lower = node.role.to_lowercase();
    let is_generic = role_lower == "generic" || role_lower == "none" || role_lower.is_empty();
    let is_landmark = LANDMARK_ROLES.contains(&role_lower.as_str());
    let has_value = node.value.as_deref().map(|v| !v.is_empty()).unwrap_or(false);
    is_generic && node.name.is_empty() && !is_landmark && !has_value
}

/// Prune/fold pass (§4.3 step 6). Returns `None` when the node should be dropped entirely.
fn fold(mut node: AxNode) -> Option<AxNode> {
    let children: Vec<AxNode> = std::mem::take(&mut node.children)
        .into_iter()
        .filter_map(fold)
        .collect();

    if is_foldable_candidate(&node) {
        match children.len() {
            0 => None,
            1 => children.into_iter().next(),
            _ => {
                node.children = children;
                Some(node)
            }
        }
    } else {
        node.children = children;
        Some(node)
    }
}

/// Resolve `selector` (CSS or xpath — the driver's search accepts either) to a backend node
/// id and find the accessibility node owning it, cloning that subtree as the new root. `None`
/// triggers the full-tree fallback of §4.3 step 7.
async fn resolve_scope(driver: &PageDriver, forest: &[AxNode], selector: &str) -> Option<AxNode> {
    let target_backend_id = driver.first_backend_node_id(selector).await.ok()?;
    forest.iter().find_map(|root| find_by_backend_id(root, target_backend_id))
}

fn find_by_backend_id(node: &AxNode, backend_node_id: i64) -> Option<AxNode> {
    if node.backend_node_id == backend_node_id {
        return Some(node.clone());
    }
    node.children
        .iter()
        .find_map(|c| find_by_backend_id(c, backend_node_id))
}

fn render(node: &AxNode, depth: usize, out: &mut String) {
    let content = if !node.name.is_empty() {
        node.name.clone()
    } else if let Some(d) = &node.description {
        d.clone()
    } else {
        String::new()
    };
    let indent = "  ".repeat(depth);
    if content.is_empty() {
        out.push_str(&format!("{indent}[{}] {}\n", node.encoded_id, node.role));
    } else {
        out.push_str(&format!(
            "{indent}[{}] {}: {}\n",
            node.encoded_id, node.role, content
        ));
    }
    for child in &node.children {
        render(child, depth + 1, out);
    }
}

fn collect_xpaths<'a>(
    driver: &'a PageDriver,
    node: &'a AxNode,
    out: &'a mut HashMap<String, String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + 'a>> {
    Box::pin(async move {
        if node.backend_node_id >= 0 {
            match xpath_for_backend_id(driver, node.backend_node_id).await {
                Ok(xp) => {
                    out.insert(node.encoded_id.clone(), xp);
                }
                Err(e) => {
                    tracing::debug!(encoded_id = %node.encoded_id, error = %e, "xpath resolution failed");
                }
            }
        }
        for child in &node.children {
            collect_xpaths(driver, child, out).await;
        }
    })
}

fn collect_urls<'a>(
    driver: &'a PageDriver,
    node: &'a AxNode,
    out: &'a mut HashMap<String, String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + 'a>> {
    Box::pin(async move {
        if URL_ROLES.contains(&node.role.to_lowercase().as_str()) && node.backend_node_id >= 0 {
            if let Ok(url) = url_for_backend_id(driver, node.backend_node_id).await {
                if let Some(url) = url {
                    out.insert(node.encoded_id.clone(), url);
                }
            }
        }
        for child in &node.children {
            collect_urls(driver, child, out).await;
        }
    })
}

async fn object_id_for_backend_id(driver: &PageDriver, backend_node_id: i64) -> Result<String> {
    let pushed = driver
        .send(
            "DOM.pushNodesByBackendIdsToFrontend",
            serde_json::json!({ "backendNodeIds": [backend_node_id] }),
        )
        .await?;
    let node_id = pushed
        .get("nodeIds")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ServiceError::Internal("no nodeId for backend id".to_string()))?;
    let resolved = driver
        .send("DOM.resolveNode", serde_json::json!({ "nodeId": node_id }))
        .await?;
    resolved
        .get("object")
        .and_then(|o| o.get("objectId"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ServiceError::Internal("node has no objectId".to_string()))
}

async fn xpath_for_backend_id(driver: &PageDriver, backend_node_id: i64) -> Result<String> {
    let object_id = object_id_for_backend_id(driver, backend_node_id).await?;
    let result = driver
        .send(
            "Runtime.callFunctionOn",
            serde_json::json!({
                "functionDeclaration": "function(){return window.__simplepage_xpath_of ? window.__simplepage_xpath_of(this) : '';}",
                "objectId": object_id,
                "returnByValue": true,
            }),
        )
        .await?;
    result
        .get("result")
        .and_then(|r| r.get("value"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| ServiceError::Internal("xpath builder returned empty".to_string()))
}

async fn url_for_backend_id(driver: &PageDriver, backend_node_id: i64) -> Result<Option<String>> {
    let object_id = object_id_for_backend_id(driver, backend_node_id).await?;
    let result = driver
        .send(
            "Runtime.callFunctionOn",
            serde_json::json!({
                "functionDeclaration": "function(){return this.href || this.currentSrc || this.src || null;}",
                "objectId": object_id,
                "returnByValue": true,
            }),
        )
        .await?;
    Ok(result
        .get("result")
        .and_then(|r| r.get("value"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(role: &str, name: &str, encoded_id: &str) -> AxNode {
        AxNode {
            role: role.to_string(),
            name: name.to_string(),
            value: None,
            description: None,
            encoded_id: encoded_id.to_string(),
            backend_node_id: 1,
            frame_ordinal: 0,
            children: vec![],
        }
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_text("  hello \n  world  "), "hello world");
    }

    #[test]
    fn fold_drops_empty_generic_with_no_children() {
        let node = AxNode {
            role: "generic".to_string(),
            name: String::new(),
            value: None,
            description: None,
            encoded_id: "0-1".to_string(),
            backend_node_id: 1,
            frame_ordinal: 0,
            children: vec![],
        };
        assert!(fold(node).is_none());
    }

    #[test]
    fn fold_collapses_single_semantic_child() {
        let mut wrapper = AxNode {
            role: "generic".to_string(),
            name: String::new(),
            value: None,
            description: None,
            encoded_id: "0-1".to_string(),
            backend_node_id: 1,
            frame_ordinal: 0,
            children: vec![leaf("button", "Go", "0-2")],
        };
        wrapper.children = vec![leaf("button", "Go", "0-2")];
        let folded = fold(wrapper).unwrap();
        assert_eq!(folded.role, "button");
        assert_eq!(folded.encoded_id, "0-2");
    }

    #[test]
    fn fold_keeps_generic_with_multiple_children() {
        let wrapper = AxNode {
            role: "generic".to_string(),
            name: String::new(),
            value: None,
            description: None,
            encoded_id: "0-1".to_string(),
            backend_node_id: 1,
            frame_ordinal: 0,
            children: vec![leaf("button", "A", "0-2"), leaf("button", "B", "0-3")],
        };
        let folded = fold(wrapper).unwrap();
        assert_eq!(folded.role, "generic");
        assert_eq!(folded.children.len(), 2);
    }

    #[test]
    fn fold_never_drops_landmark() {
        let node = AxNode {
            role: "main".to_string(),
            name: String::new(),
            value: None,
            description: None,
            encoded_id: "0-1".to_string(),
            backend_node_id: 1,
            frame_ordinal: 0,
            children: vec![],
        };
        assert!(fold(node).is_some());
    }

    #[test]
    fn render_emits_one_line_per_node() {
        let root = AxNode {
            role: "WebArea".to_string(),
            name: "Example".to_string(),
            value: None,
            description: None,
            encoded_id: "0-1".to_string(),
            backend_node_id: 1,
            frame_ordinal: 0,
            children: vec![leaf("button", "Go", "0-2")],
        };
        let mut out = String::new();
        render(&root, 0, &mut out);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "[0-1] WebArea: Example");
        assert_eq!(lines[1], "  [0-2] button: Go");
    }
}
