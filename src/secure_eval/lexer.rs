//! A small JavaScript lexer sufficient for the static screen: it
//! understands comments, string and template literals (including
//! nested `${}` expressions), numbers, identifiers, and punctuation.
//! It does not build an AST; the screen's rules run over the token
//! stream.

/// One lexed token. Template `${}` expressions are flattened into the
/// main stream so the rules see their contents.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Number,
    /// String literal (content without quotes, escapes resolved
    /// enough for pattern matching).
    Str(String),
    /// Static text of a template literal.
    Template(String),
    Punct(char),
}

/// The lexer gave up (unterminated literal, stray byte). The screen
/// passes such sources through: the page will reject them at parse
/// time anyway.
#[derive(Debug, PartialEq, Eq)]
pub struct LexError;

/// Tokenize a JavaScript source.
///
/// # Errors
///
/// `LexError` on malformed input the lexer cannot recover from.
pub fn lex(source: &str) -> Result<Vec<Token>, LexError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;
    lex_into(&chars, &mut pos, &mut tokens, None)?;
    Ok(tokens)
}

/// Lex until end of input or until `stop` (used for `${ ... }` bodies,
/// where `stop` is the closing brace at depth zero).
fn lex_into(
    chars: &[char],
    pos: &mut usize,
    tokens: &mut Vec<Token>,
    stop: Option<char>,
) -> Result<(), LexError> {
    let mut brace_depth = 0u32;
    while *pos < chars.len() {
        let c = chars[*pos];

        if let Some(stop_char) = stop
            && c == stop_char
            && brace_depth == 0
        {
            return Ok(());
        }

        match c {
            _ if c.is_whitespace() => {
                *pos += 1;
            }
            '/' if peek(chars, *pos + 1) == Some('/') => {
                while *pos < chars.len() && chars[*pos] != '\n' {
                    *pos += 1;
                }
            }
            '/' if peek(chars, *pos + 1) == Some('*') => {
                *pos += 2;
                loop {
                    if *pos + 1 >= chars.len() {
                        return Err(LexError);
                    }
                    if chars[*pos] == '*' && chars[*pos + 1] == '/' {
                        *pos += 2;
                        break;
                    }
                    *pos += 1;
                }
            }
            '"' | '\'' => {
                let content = lex_string(chars, pos, c)?;
                tokens.push(Token::Str(content));
            }
            '`' => {
                lex_template(chars, pos, tokens)?;
            }
            _ if c.is_ascii_digit() => {
                while *pos < chars.len()
                    && (chars[*pos].is_ascii_alphanumeric() || chars[*pos] == '.')
                {
                    *pos += 1;
                }
                tokens.push(Token::Number);
            }
            _ if c == '_' || c == '$' || c.is_alphabetic() => {
                let start = *pos;
                while *pos < chars.len()
                    && (chars[*pos] == '_' || chars[*pos] == '$' || chars[*pos].is_alphanumeric())
                {
                    *pos += 1;
                }
                tokens.push(Token::Ident(chars[start..*pos].iter().collect()));
            }
            _ => {
                if c == '{' {
                    brace_depth += 1;
                } else if c == '}' {
                    brace_depth = brace_depth.saturating_sub(1);
                }
                tokens.push(Token::Punct(c));
                *pos += 1;
            }
        }
    }
    if stop.is_some() {
        // The `${` body never closed.
        return Err(LexError);
    }
    Ok(())
}

fn peek(chars: &[char], pos: usize) -> Option<char> {
    chars.get(pos).copied()
}

fn lex_string(chars: &[char], pos: &mut usize, quote: char) -> Result<String, LexError> {
    *pos += 1; // opening quote
    let mut content = String::new();
    while *pos < chars.len() {
        let c = chars[*pos];
        if c == '\\' {
            // Keep the escaped character verbatim; enough for the
            // pattern rules, which don't need full escape semantics.
            if let Some(next) = peek(chars, *pos + 1) {
                content.push(next);
                *pos += 2;
                continue;
            }
            return Err(LexError);
        }
        if c == quote {
            *pos += 1;
            return Ok(content);
        }
        if c == '\n' {
            return Err(LexError);
        }
        content.push(c);
        *pos += 1;
    }
    Err(LexError)
}

fn lex_template(chars: &[char], pos: &mut usize, tokens: &mut Vec<Token>) -> Result<(), LexError> {
    *pos += 1; // opening backtick
    let mut static_text = String::new();
    while *pos < chars.len() {
        let c = chars[*pos];
        if c == '\\' {
            if let Some(next) = peek(chars, *pos + 1) {
                static_text.push(next);
                *pos += 2;
                continue;
            }
            return Err(LexError);
        }
        if c == '`' {
            *pos += 1;
            tokens.push(Token::Template(static_text));
            return Ok(());
        }
        if c == '$' && peek(chars, *pos + 1) == Some('{') {
            *pos += 2;
            // Flatten the embedded expression into the main stream so
            // the rules inspect it like any other code.
            lex_into(chars, pos, tokens, Some('}'))?;
            if peek(chars, *pos) != Some('}') {
                return Err(LexError);
            }
            *pos += 1;
            continue;
        }
        static_text.push(c);
        *pos += 1;
    }
    Err(LexError)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idents(tokens: &[Token]) -> Vec<&str> {
        tokens
            .iter()
            .filter_map(|t| match t {
                Token::Ident(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn lex_simple_call() {
        let tokens = lex("fetch('/api')").unwrap();
        assert_eq!(tokens[0], Token::Ident("fetch".into()));
        assert_eq!(tokens[1], Token::Punct('('));
        assert_eq!(tokens[2], Token::Str("/api".into()));
    }

    #[test]
    fn comments_are_skipped() {
        let tokens = lex("a // fetch('/x')\n/* eval() */ b").unwrap();
        assert_eq!(idents(&tokens), vec!["a", "b"]);
    }

    #[test]
    fn strings_with_escapes() {
        let tokens = lex(r#"x = "a\"b""#).unwrap();
        assert!(tokens.contains(&Token::Str("a\"b".into())));
    }

    #[test]
    fn template_static_text_kept() {
        let tokens = lex("`hello world`").unwrap();
        assert_eq!(tokens, vec![Token::Template("hello world".into())]);
    }

    #[test]
    fn template_expressions_flattened() {
        let tokens = lex("`value: ${window.fetch}`").unwrap();
        assert!(idents(&tokens).contains(&"window"));
        assert!(idents(&tokens).contains(&"fetch"));
    }

    #[test]
    fn nested_template_braces() {
        let tokens = lex("`${ {a: 1}.a }`").unwrap();
        assert!(idents(&tokens).contains(&"a"));
    }

    #[test]
    fn unterminated_string_is_error() {
        assert_eq!(lex("'oops"), Err(LexError));
        assert_eq!(lex("`oops"), Err(LexError));
        assert_eq!(lex("/* oops"), Err(LexError));
    }

    #[test]
    fn numbers_lump_together() {
        let tokens = lex("1.5e3 + x2").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Number,
                Token::Punct('+'),
                Token::Ident("x2".into()),
            ]
        );
    }
}
