//! Layer 3 of the secure-eval defense: wrap the source in an IIFE whose
//! body runs under `with (__proxy)`, where `__proxy` traps blocked
//! property names on `window` at runtime.

/// Property names the page proxy refuses to hand out.
pub const PROXY_BLOCKED_PROPS: [&str; 22] = [
    "fetch",
    "eval",
    "atob",
    "btoa",
    "Function",
    "XMLHttpRequest",
    "WebSocket",
    "EventSource",
    "Worker",
    "SharedWorker",
    "RTCPeerConnection",
    "Image",
    "importScripts",
    "localStorage",
    "sessionStorage",
    "indexedDB",
    "open",
    "Reflect",
    "Proxy",
    "globalThis",
    "top",
    "parent",
];

/// Wrap agent code for execution behind the page proxy.
///
/// The wrapped form is what actually reaches `Runtime.evaluate`; the
/// accompanying `prewrapped: true` flag tells the page-side evaluator
/// not to wrap again.
#[must_use]
pub fn wrap_with_page_proxy(source: &str) -> String {
    let blocked_list = PROXY_BLOCKED_PROPS
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let body = if is_bare_expression(source) {
        format!("return ({source});")
    } else {
        source.to_owned()
    };
    format!(
        r#"(function () {{
  var __blocked = [{blocked_list}];
  var __isBlocked = function (prop) {{ return __blocked.indexOf(String(prop)) !== -1; }};
  var __proxy = new Proxy(window, {{
    get: function (_, prop) {{
      if (__isBlocked(prop)) {{ throw new Error("[secure_eval] Blocked: " + String(prop)); }}
      var value = window[prop];
      return typeof value === "function" ? value.bind(window) : value;
    }},
    has: function () {{ return true; }},
    getOwnPropertyDescriptor: function (_, prop) {{
      if (__isBlocked(prop)) {{ throw new Error("[secure_eval] Blocked: " + String(prop)); }}
      return Object.getOwnPropertyDescriptor(window, prop);
    }},
    ownKeys: function () {{
      return Object.keys(window).filter(function (key) {{ return !__isBlocked(key); }});
    }},
  }});
  with (__proxy) {{
    return (function () {{
      "use strict";
      {body}
    }}).call(window);
  }}
}})()"#
    )
}

/// Heuristic: a single-line, statement-free source is treated as an
/// expression so its completion value survives the wrapping.
fn is_bare_expression(source: &str) -> bool {
    let trimmed = source.trim();
    if trimmed.is_empty() || trimmed.contains(';') || trimmed.contains('\n') {
        return false;
    }
    const STATEMENT_KEYWORDS: [&str; 10] = [
        "const", "let", "var", "if", "for", "while", "return", "function", "class", "throw",
    ];
    let first_word = trimmed
        .split(|c: char| !c.is_ascii_alphanumeric())
        .next()
        .unwrap_or("");
    !STATEMENT_KEYWORDS.contains(&first_word)
}
