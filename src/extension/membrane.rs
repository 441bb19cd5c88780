//! Layer 2 of the secure-eval defense, extension side: the membrane
//! validator.
//!
//! The reference design runs agent code against a fully recursive
//! proxy whose traps throw when an access chain reaches a blocked
//! name. This runtime has no JavaScript proxies, so `validateEval`
//! reproduces the membrane's observable behavior statically: it walks
//! every access chain in the source and throws the same
//! `[secure_eval:membrane] Blocked: <chain>` errors.
//!
//! Two rule shapes apply. Global and reflection names are dangerous no
//! matter how they are reached (`fetch`, `window.fetch`,
//! `x.constructor`). Names like `cookie`, `write`, or `replace` are
//! only dangerous under a specific parent: `document.cookie` is
//! blocked, `myObj.cookie` is not, and `text.replace('a', 'b')` must
//! pass.

use crate::secure_eval::lexer::{Token, lex};

/// Names refused at any position in an access chain: globals and
/// reflection escape hatches.
const BLOCKED_NAMES: [&str; 21] = [
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
    "localStorage",
    "sessionStorage",
    "constructor",
    "__proto__",
    "globalThis",
    "Reflect",
    "Proxy",
    "getPrototypeOf",
    "defineProperty",
];

/// Property names refused only under their specific parent.
const BLOCKED_PAIRS: [(&str, &str); 11] = [
    ("navigator", "sendBeacon"),
    ("document", "cookie"),
    ("document", "write"),
    ("document", "writeln"),
    ("document", "defaultView"),
    ("location", "assign"),
    ("location", "replace"),
    ("String", "fromCharCode"),
    ("String", "raw"),
    ("Object", "getOwnPropertyDescriptor"),
    ("Object", "getOwnPropertyDescriptors"),
];

/// Validate code the way the membrane would.
///
/// # Errors
///
/// The membrane error message, `[secure_eval:membrane] Blocked:
/// <chain>`, for the first access chain that reaches a blocked name.
pub fn validate(code: &str) -> Result<(), String> {
    let Ok(tokens) = lex(code) else {
        // The membrane never sees unparsable code; the page rejects it
        // first. Not provably dangerous, so not a block.
        return Ok(());
    };

    let mut i = 0;
    while i < tokens.len() {
        let Token::Ident(_) = &tokens[i] else {
            i += 1;
            continue;
        };
        if i > 0 && tokens[i - 1] == Token::Punct('.') {
            i += 1;
            continue;
        }
        let (chain, next) = collect_chain(&tokens, i);
        check_chain(&chain)?;
        i = next.max(i + 1);
    }
    Ok(())
}

fn check_chain(chain: &[String]) -> Result<(), String> {
    for (index, segment) in chain.iter().enumerate() {
        // A bare `constructor` identifier is class syntax, not a
        // property walk; it only counts in member position.
        if segment == "constructor" && index == 0 {
            continue;
        }
        if BLOCKED_NAMES.contains(&segment.as_str()) {
            return Err(blocked(&chain[..=index]));
        }
        if index > 0 {
            let parent = chain[index - 1].as_str();
            if BLOCKED_PAIRS.contains(&(parent, segment.as_str())) {
                return Err(blocked(&chain[..=index]));
            }
        }
    }
    Ok(())
}

fn blocked(chain: &[String]) -> String {
    format!("[secure_eval:membrane] Blocked: {}", chain.join("."))
}

/// Collect a dotted/bracket access chain starting at an identifier.
fn collect_chain(tokens: &[Token], start: usize) -> (Vec<String>, usize) {
    let Token::Ident(head) = &tokens[start] else {
        return (Vec::new(), start + 1);
    };
    let mut chain = vec![head.clone()];
    let mut i = start + 1;
    loop {
        match (tokens.get(i), tokens.get(i + 1)) {
            (Some(Token::Punct('.')), Some(Token::Ident(name))) => {
                chain.push(name.clone());
                i += 2;
            }
            (Some(Token::Punct('[')), Some(Token::Str(name)))
                if tokens.get(i + 2) == Some(&Token::Punct(']')) =>
            {
                chain.push(name.clone());
                i += 3;
            }
            _ => break,
        }
    }
    (chain, i)
}
