//! DOM reading: accessibility-tree snapshots, text lookup, and matched
//! style inspection.

use std::fmt::Write as _;

use serde_json::{Value, json};

use crate::error::BrokerError;

use super::primitives::json_string;
use super::{ToolDispatcher, ToolReply};

// ===========================================================================
// browser_snapshot
// ===========================================================================

/// Roles that add noise without information; they are elided and their
/// children promoted.
const ELIDED_ROLES: [&str; 3] = ["none", "generic", "InlineTextBox"];

struct AxNode {
    node_id: String,
    ignored: bool,
    role: String,
    name: String,
    child_ids: Vec<String>,
}

fn parse_ax_nodes(nodes: &[Value]) -> Vec<AxNode> {
    nodes
        .iter()
        .map(|n| AxNode {
            node_id: n["nodeId"].as_str().unwrap_or_default().to_owned(),
            ignored: n["ignored"].as_bool().unwrap_or(false),
            role: n["role"]["value"].as_str().unwrap_or_default().to_owned(),
            name: n["name"]["value"].as_str().unwrap_or_default().to_owned(),
            child_ids: n["childIds"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
        })
        .collect()
}

/// Render the flat `Accessibility.getFullAXTree` response as an
/// indented outline, eliding ignored nodes and noise roles.
#[must_use]
pub fn render_ax_tree(nodes: &[Value]) -> String {
    let ax_nodes = parse_ax_nodes(nodes);
    let Some(root) = ax_nodes.iter().find(|n| !n.ignored) else {
        return String::from("(empty tree)");
    };
    let mut out = String::new();
    render_node(&ax_nodes, &root.node_id, 0, &mut out);
    if out.is_empty() {
        out.push_str("(empty tree)");
    }
    out
}

fn render_node(nodes: &[AxNode], node_id: &str, depth: usize, out: &mut String) {
    let Some(node) = nodes.iter().find(|n| n.node_id == node_id) else {
        return;
    };
    let elided = node.ignored || ELIDED_ROLES.contains(&node.role.as_str());
    let child_depth = if elided {
        depth
    } else {
        if node.name.is_empty() {
            let _ = writeln!(out, "{}- {}", "  ".repeat(depth), node.role);
        } else {
            let _ = writeln!(
                out,
                "{}- {} \"{}\"",
                "  ".repeat(depth),
                node.role,
                node.name
            );
        }
        depth + 1
    };
    for child_id in &node.child_ids {
        render_node(nodes, child_id, child_depth, out);
    }
}

pub async fn snapshot(d: &ToolDispatcher, _args: &Value) -> Result<ToolReply, BrokerError> {
    d.cdp("Accessibility.enable", json!({})).await?;
    let result = d.cdp("Accessibility.getFullAXTree", json!({})).await?;
    let nodes = result
        .get("nodes")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let tree = render_ax_tree(&nodes);
    Ok(ToolReply::text(
        tree.clone(),
        json!({"success": true, "snapshot": tree, "node_count": nodes.len()}),
    ))
}

// ===========================================================================
// browser_lookup
// ===========================================================================

pub async fn lookup(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let text = args
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidParams("text is required".into()))?;
    let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(10);

    let snippet = format!(
        r"(function() {{
  var phrase = {phrase}.toLowerCase();
  var visible = [], hidden = [];
  var all = document.querySelectorAll('*');
  for (var i = 0; i < all.length; i++) {{
    var el = all[i];
    var direct = '';
    for (var c = el.firstChild; c; c = c.nextSibling) {{
      if (c.nodeType === 3) {{ direct += c.textContent; }}
    }}
    if (direct.toLowerCase().indexOf(phrase) === -1) {{ continue; }}
    var style = window.getComputedStyle(el);
    var rect = el.getBoundingClientRect();
    var isVisible = style.display !== 'none' && style.visibility !== 'hidden'
      && style.opacity !== '0' && rect.width > 0 && rect.height > 0;
    var sel = el.id ? '#' + el.id
      : el.classList.length ? el.tagName.toLowerCase() + '.' + el.classList[0]
      : el.tagName.toLowerCase();
    var entry = {{selector: sel, tag: el.tagName.toLowerCase(),
      text: direct.trim().slice(0, 120), visible: isVisible}};
    (isVisible ? visible : hidden).push(entry);
  }}
  return visible.concat(hidden).slice(0, {limit});
}})()",
        phrase = json_string(text),
    );
    let matches = d.eval(&snippet).await?;
    let count = matches.as_array().map_or(0, Vec::len);
    let summary = if count == 0 {
        format!("No elements contain \"{text}\".")
    } else {
        format!("{count} element(s) contain \"{text}\" (visible first).")
    };
    Ok(ToolReply::json(
        &summary,
        json!({"success": count > 0, "matches": matches}),
    ))
}

// ===========================================================================
// browser_get_element_styles
// ===========================================================================

pub async fn element_styles(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let selector = args
        .get("selector")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::InvalidParams("selector is required".into()))?;
    let property_filter = args.get("property_filter").and_then(Value::as_str);

    d.cdp("DOM.enable", json!({})).await?;
    d.cdp("CSS.enable", json!({})).await?;
    let node_id = super::interact::resolve_node_id(d, selector).await?;

    if let Some(state) = args.get("pseudo_state").and_then(Value::as_str) {
        d.cdp(
            "CSS.forcePseudoState",
            json!({"nodeId": node_id, "forcedPseudoClasses": [state]}),
        )
        .await?;
    }

    let matched = d
        .cdp("CSS.getMatchedStylesForNode", json!({"nodeId": node_id}))
        .await?;
    let annotated = annotate_matched_styles(&matched, property_filter);

    let mut obfuscated = false;
    let mut lines = Vec::new();
    for entry in &annotated {
        let source = entry.source.as_deref().map(clean_css_filename);
        if let Some((_, was_hashed)) = &source
            && *was_hashed
        {
            obfuscated = true;
        }
        let marker = entry.status;
        let location = source.map_or(String::new(), |(name, _)| format!(" ({name})"));
        lines.push(format!(
            "{}: {} [{marker}]{location}",
            entry.property, entry.value
        ));
    }
    if let Some(manager) = d.manager() {
        manager.set_css_obfuscation(obfuscated);
    }

    let data = json!({
        "success": true,
        "selector": selector,
        "properties": annotated.iter().map(|e| json!({
            "property": e.property,
            "value": e.value,
            "status": e.status,
            "source": e.source.as_deref().map(|s| clean_css_filename(s).0),
        })).collect::<Vec<_>>(),
        "obfuscated_css": obfuscated,
    });
    Ok(ToolReply::text(
        format!("Styles for {selector}:\n{}", lines.join("\n")),
        data,
    ))
}

/// One annotated declaration from the matched-rules cascade.
#[derive(Debug)]
pub struct StyleEntry {
    pub property: String,
    pub value: String,
    /// `applied` or `overridden`.
    pub status: &'static str,
    pub source: Option<String>,
}

/// Walk `CSS.getMatchedStylesForNode` output, marking the winning
/// declaration per property `applied` and shadowed ones `overridden`.
///
/// Matched rules arrive in ascending precedence order; the inline style
/// beats them all.
#[must_use]
pub fn annotate_matched_styles(matched: &Value, property_filter: Option<&str>) -> Vec<StyleEntry> {
    struct RawDecl {
        property: String,
        value: String,
        source: Option<String>,
    }

    let mut decls: Vec<RawDecl> = Vec::new();
    if let Some(rules) = matched.get("matchedCSSRules").and_then(Value::as_array) {
        for entry in rules {
            let rule = &entry["rule"];
            let source = rule["styleSheetId"]
                .as_str()
                .map(str::to_owned)
                .or_else(|| rule["origin"].as_str().map(str::to_owned));
            let source = rule
                .pointer("/style/styleSheetHref")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .or(source);
            if let Some(props) = rule.pointer("/style/cssProperties").and_then(Value::as_array) {
                for prop in props {
                    if let (Some(name), Some(value)) =
                        (prop["name"].as_str(), prop["value"].as_str())
                    {
                        decls.push(RawDecl {
                            property: name.to_owned(),
                            value: value.to_owned(),
                            source: source.clone(),
                        });
                    }
                }
            }
        }
    }
    if let Some(props) = matched
        .pointer("/inlineStyle/cssProperties")
        .and_then(Value::as_array)
    {
        for prop in props {
            if let (Some(name), Some(value)) = (prop["name"].as_str(), prop["value"].as_str()) {
                decls.push(RawDecl {
                    property: name.to_owned(),
                    value: value.to_owned(),
                    source: Some("inline".to_owned()),
                });
            }
        }
    }

    // Later declarations win; walk backwards so the first sighting of a
    // property is the applied one.
    let mut seen: Vec<&str> = Vec::new();
    let mut annotated: Vec<StyleEntry> = Vec::new();
    for decl in decls.iter().rev() {
        if let Some(filter) = property_filter
            && !decl.property.contains(filter)
        {
            continue;
        }
        let status = if seen.contains(&decl.property.as_str()) {
            "overridden"
        } else {
            "applied"
        };
        annotated.push(StyleEntry {
            property: decl.property.clone(),
            value: decl.value.clone(),
            status,
            source: decl.source.clone(),
        });
        if status == "applied" {
            seen.push(&decl.property);
        }
    }
    annotated.reverse();
    annotated
}

/// Strip build hashes out of stylesheet filenames
/// (`app-abc123.css` becomes `app.css`); the boolean reports whether a
/// hash was removed.
#[must_use]
pub fn clean_css_filename(source: &str) -> (String, bool) {
    let file = source.rsplit('/').next().unwrap_or(source);
    let Some(stem) = file.strip_suffix(".css") else {
        return (file.to_owned(), false);
    };
    let Some((name, hash)) = stem.rsplit_once('-') else {
        return (file.to_owned(), false);
    };
    let hashy = hash.len() >= 6
        && hash.chars().all(|c| c.is_ascii_alphanumeric())
        && hash.chars().any(|c| c.is_ascii_digit());
    if hashy && !name.is_empty() {
        (format!("{name}.css"), true)
    } else {
        (file.to_owned(), false)
    }
}
