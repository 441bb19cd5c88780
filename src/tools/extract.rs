//! Main-content extraction: the page side detects the content subtree
//! and returns its HTML; the broker converts it to markdown and
//! paginates by line.

use kuchiki::NodeRef;
use kuchiki::traits::TendrilSink;
use serde_json::{Value, json};

use crate::error::BrokerError;

use super::primitives::json_string;
use super::{ToolDispatcher, ToolReply};

/// Default page size, in markdown lines.
const DEFAULT_MAX_LINES: usize = 500;

pub async fn run(d: &ToolDispatcher, args: &Value) -> Result<ToolReply, BrokerError> {
    let selector = args.get("selector").and_then(Value::as_str);
    let offset = args
        .get("offset")
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(0);
    let max_lines = args
        .get("max_lines")
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(DEFAULT_MAX_LINES);

    let snippet = detect_content_snippet(selector);
    let result = d.eval(&snippet).await?;
    let html = result
        .get("html")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::Peer {
            message: "page returned no content subtree".into(),
        })?;
    let source = result
        .get("source")
        .and_then(Value::as_str)
        .unwrap_or("body");

    let markdown = html_to_markdown(html);
    let lines: Vec<&str> = markdown.lines().collect();
    let total = lines.len();
    let page: Vec<&str> = lines.into_iter().skip(offset).take(max_lines).collect();
    let returned = page.len();
    let truncated = offset + returned < total;
    let text = page.join("\n");

    let mut summary = format!(
        "Content from <{source}> ({returned} of {total} lines"
    );
    if truncated {
        summary.push_str(&format!(
            ", continue with offset {}",
            offset + returned
        ));
    }
    summary.push_str("):\n\n");
    summary.push_str(&text);

    Ok(ToolReply::text(
        summary,
        json!({
            "success": true,
            "source": source,
            "markdown": text,
            "total_lines": total,
            "offset": offset,
            "returned_lines": returned,
            "truncated": truncated,
        }),
    ))
}

/// Page-side detection: an explicit selector wins; otherwise the first
/// of the usual main-content candidates; body as a last resort.
fn detect_content_snippet(selector: Option<&str>) -> String {
    let explicit = selector.map_or("null".to_owned(), json_string);
    format!(
        r"(function() {{
  var explicit = {explicit};
  if (explicit) {{
    var el = document.querySelector(explicit);
    return el ? {{html: el.outerHTML, source: explicit}} : null;
  }}
  var candidates = ['main', 'article', '[role=main]', '#content', '.content'];
  for (var i = 0; i < candidates.length; i++) {{
    var el = document.querySelector(candidates[i]);
    if (el && el.textContent.trim().length > 80) {{
      return {{html: el.outerHTML, source: candidates[i]}};
    }}
  }}
  return {{html: document.body.outerHTML, source: 'body'}};
}})()"
    )
}

// ===========================================================================
// HTML → markdown
// ===========================================================================

/// Convert an HTML fragment to markdown.
///
/// Block elements emit their own paragraphs; inline markup maps to the
/// usual markdown spans. Script/style subtrees are skipped.
#[must_use]
pub fn html_to_markdown(html: &str) -> String {
    let document = kuchiki::parse_html().one(html);
    let mut out = String::new();
    render_children(&document, &mut out, &ListContext::None);
    collapse_blank_runs(&out)
}

enum ListContext {
    None,
    Unordered(usize),
    Ordered(usize, std::cell::Cell<usize>),
}

fn render_children(node: &NodeRef, out: &mut String, list: &ListContext) {
    for child in node.children() {
        render_node(&child, out, list);
    }
}

fn render_node(node: &NodeRef, out: &mut String, list: &ListContext) {
    if let Some(text) = node.as_text() {
        let content = text.borrow();
        let squashed = squash_whitespace(&content);
        if squashed.trim().is_empty() {
            // Whitespace-only nodes separate inline content; they mean
            // nothing at a line boundary.
            if !out.is_empty() && !out.ends_with('\n') && !out.ends_with(' ') {
                out.push(' ');
            }
            return;
        }
        let piece = if out.is_empty() || out.ends_with('\n') || out.ends_with(' ') {
            squashed.trim_start()
        } else {
            squashed.as_str()
        };
        out.push_str(piece);
        return;
    }

    let Some(element) = node.as_element() else {
        render_children(node, out, list);
        return;
    };

    let tag: &str = &element.name.local;
    match tag {
        "script" | "style" | "noscript" | "template" | "head" => {}
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = tag.as_bytes()[1] - b'0';
            ensure_blank_line(out);
            out.push_str(&"#".repeat(usize::from(level)));
            out.push(' ');
            out.push_str(inline_text(node).trim());
            out.push_str("\n\n");
        }
        "p" | "section" | "header" | "footer" | "figure" | "figcaption" => {
            ensure_blank_line(out);
            render_children(node, out, list);
            out.push_str("\n\n");
        }
        "div" | "main" | "article" | "aside" | "nav" | "body" | "html" => {
            render_children(node, out, list);
            ensure_newline(out);
        }
        "br" => out.push('\n'),
        "hr" => {
            ensure_blank_line(out);
            out.push_str("---\n\n");
        }
        "strong" | "b" => wrap_inline(node, out, "**", list),
        "em" | "i" => wrap_inline(node, out, "*", list),
        "del" | "s" => wrap_inline(node, out, "~~", list),
        "code" => {
            // Inline code only; pre>code handled by "pre".
            out.push('`');
            out.push_str(inline_text(node).trim());
            out.push('`');
        }
        "pre" => {
            ensure_blank_line(out);
            out.push_str("```\n");
            out.push_str(raw_text(node).trim_end());
            out.push_str("\n```\n\n");
        }
        "a" => {
            let href = element
                .attributes
                .borrow()
                .get("href")
                .unwrap_or("")
                .to_owned();
            let text = inline_text(node);
            let text = text.trim();
            if href.is_empty() || href.starts_with('#') {
                out.push_str(text);
            } else {
                out.push_str(&format!("[{text}]({href})"));
            }
        }
        "img" => {
            let attrs = element.attributes.borrow();
            let alt = attrs.get("alt").unwrap_or("").to_owned();
            let src = attrs.get("src").unwrap_or("").to_owned();
            if !src.is_empty() {
                out.push_str(&format!("![{alt}]({src})"));
            }
        }
        "ul" => {
            ensure_newline(out);
            let depth = list_depth(list);
            render_children(node, out, &ListContext::Unordered(depth));
            ensure_newline(out);
        }
        "ol" => {
            ensure_newline(out);
            let depth = list_depth(list);
            render_children(
                node,
                out,
                &ListContext::Ordered(depth, std::cell::Cell::new(1)),
            );
            ensure_newline(out);
        }
        "li" => {
            ensure_newline(out);
            match list {
                ListContext::Ordered(depth, counter) => {
                    let n = counter.get();
                    counter.set(n + 1);
                    out.push_str(&"  ".repeat(*depth));
                    out.push_str(&format!("{n}. "));
                }
                ListContext::Unordered(depth) => {
                    out.push_str(&"  ".repeat(*depth));
                    out.push_str("- ");
                }
                ListContext::None => out.push_str("- "),
            }
            render_children(node, out, list);
            ensure_newline(out);
        }
        "blockquote" => {
            ensure_blank_line(out);
            let mut inner = String::new();
            render_children(node, &mut inner, list);
            for line in collapse_blank_runs(&inner).lines() {
                out.push_str("> ");
                out.push_str(line);
                out.push('\n');
            }
            out.push('\n');
        }
        "table" => {
            ensure_blank_line(out);
            render_table(node, out);
            out.push('\n');
        }
        _ => render_children(node, out, list),
    }
}

fn list_depth(list: &ListContext) -> usize {
    match list {
        ListContext::None => 0,
        ListContext::Unordered(depth) | ListContext::Ordered(depth, _) => depth + 1,
    }
}

fn wrap_inline(node: &NodeRef, out: &mut String, marker: &str, _list: &ListContext) {
    let text = inline_text(node);
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    out.push_str(marker);
    out.push_str(text);
    out.push_str(marker);
}

fn render_table(table: &NodeRef, out: &mut String) {
    let mut rows: Vec<Vec<String>> = Vec::new();
    collect_rows(table, &mut rows);
    if rows.is_empty() {
        return;
    }
    for (i, row) in rows.iter().enumerate() {
        out.push_str(&format!("| {} |\n", row.join(" | ")));
        if i == 0 {
            out.push_str(&format!("|{}\n", " --- |".repeat(row.len())));
        }
    }
}

fn collect_rows(node: &NodeRef, rows: &mut Vec<Vec<String>>) {
    for child in node.children() {
        let Some(element) = child.as_element() else {
            continue;
        };
        let tag: &str = &element.name.local;
        match tag {
            "tr" => {
                let mut cells = Vec::new();
                for cell in child.children() {
                    if let Some(cell_el) = cell.as_element() {
                        let cell_tag: &str = &cell_el.name.local;
                        if cell_tag == "td" || cell_tag == "th" {
                            cells.push(inline_text(&cell).trim().to_owned());
                        }
                    }
                }
                if !cells.is_empty() {
                    rows.push(cells);
                }
            }
            "thead" | "tbody" | "tfoot" => collect_rows(&child, rows),
            _ => {}
        }
    }
}

/// Flattened text content with whitespace squashed (for headings,
/// links, cells).
fn inline_text(node: &NodeRef) -> String {
    let mut out = String::new();
    for descendant in node.descendants() {
        if let Some(text) = descendant.as_text() {
            out.push_str(&text.borrow());
        }
    }
    squash_whitespace(&out)
}

/// Verbatim text content (for code blocks).
fn raw_text(node: &NodeRef) -> String {
    let mut out = String::new();
    for descendant in node.descendants() {
        if let Some(text) = descendant.as_text() {
            out.push_str(&text.borrow());
        }
    }
    out
}

/// Collapse whitespace runs to single spaces, keeping single leading
/// and trailing separators so adjacent inline nodes stay apart.
fn squash_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(c);
            last_space = false;
        }
    }
    out
}

fn ensure_newline(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn ensure_blank_line(out: &mut String) {
    ensure_newline(out);
    if !out.is_empty() && !out.ends_with("\n\n") {
        out.push('\n');
    }
}

/// Cap consecutive blank lines at one and trim the edges.
fn collapse_blank_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blanks = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blanks += 1;
            if blanks > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blanks = 0;
            out.push_str(line.trim_end());
            out.push('\n');
        }
    }
    out.trim().to_owned()
}
