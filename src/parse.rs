//! Model response parsing for `<Thought>..</Thought><Action>name(args)</Action>` replies.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use crate::action::{self, Action, ArgKind, ElementId};

/// Outcome of parsing one model response. Never both a success and an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedResponse {
    Success { thought: String, action: Action },
    Error { raw: String, reason: String },
}

impl ParsedResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, ParsedResponse::Error { .. })
    }

    /// The action, when parsing succeeded.
    pub fn action(&self) -> Option<&Action> {
        match self {
            ParsedResponse::Success { action, .. } => Some(action),
            ParsedResponse::Error { .. } => None,
        }
    }
}

fn thought_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<Thought>(.*?)</Thought>").unwrap())
}

fn action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<Action>(.*?)</Action>").unwrap())
}

fn call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^\s*(\w+)\s*\((.*)\)\s*$").unwrap())
}

/// Parse raw model output into a typed action. Failures are returned as
/// [`ParsedResponse::Error`] carrying the untouched input.
pub fn parse_response(text: &str) -> ParsedResponse {
    match parse_inner(text) {
        Ok((thought, action)) => ParsedResponse::Success { thought, action },
        Err(reason) => ParsedResponse::Error {
            raw: text.to_string(),
            reason,
        },
    }
}

fn parse_inner(text: &str) -> std::result::Result<(String, Action), String> {
    let thought = thought_re()
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .ok_or("Thought not found in the model response")?;
    let call = action_re()
        .captures(text)
        .map(|c| c[1].to_string())
        .ok_or("Action not found in the model response")?;

    let caps = call_re().captures(&call).ok_or_else(|| {
        format!(
            "action should be in the format functionName(arg1, arg2, ...), got \"{}\"",
            call.trim()
        )
    })?;
    let name = &caps[1];
    let args_str = caps[2].trim();

    let spec = action::spec(name).ok_or_else(|| format!("\"{}\" is not a valid action", name))?;

    let args = split_args(args_str, spec.args.len(), spec.args.last().map(|a| a.kind));
    if args.len() != spec.args.len() {
        return Err(format!(
            "expected {} argument(s) for action \"{}\", but got {}",
            spec.args.len(),
            name,
            args.len()
        ));
    }

    let mut numbers = Vec::new();
    let mut strings = Vec::new();
    for (arg, arg_spec) in args.iter().zip(spec.args) {
        match arg_spec.kind {
            ArgKind::Number => numbers.push(parse_number(arg).ok_or_else(|| {
                format!(
                    "expected a number for argument \"{}\", but got \"{}\"",
                    arg_spec.name, arg
                )
            })?),
            ArgKind::String => strings.push(unquote(arg).ok_or_else(|| {
                format!(
                    "expected a string for argument \"{}\", but got \"{}\"",
                    arg_spec.name, arg
                )
            })?),
        }
    }

    let action = match (name, numbers.as_slice(), strings.as_mut_slice()) {
        ("click", [id], []) => Action::Click {
            element_id: ElementId(*id),
        },
        ("setValue", [id], [value]) => Action::SetValue {
            element_id: ElementId(*id),
            value: std::mem::take(value),
        },
        ("finish", [], []) => Action::Finish,
        ("fail", [], []) => Action::Fail,
        _ => return Err(format!("\"{}\" is not a valid action", name)),
    };

    Ok((thought, action))
}

/// Split an argument list. When the last argument is a string, only the first
/// `arity - 1` commas separate arguments so the value itself may contain commas.
fn split_args(args: &str, arity: usize, last: Option<ArgKind>) -> Vec<String> {
    if args.is_empty() {
        return Vec::new();
    }
    let parts: Vec<&str> = if last == Some(ArgKind::String) {
        args.splitn(arity, ',').collect()
    } else {
        args.split(',').collect()
    };
    parts.into_iter().map(|p| p.trim().to_string()).collect()
}

/// Base-10 only: no sign, no hex, no fraction.
fn parse_number(arg: &str) -> Option<u32> {
    if arg.is_empty() || !arg.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    arg.parse().ok()
}

/// Strip one pair of matching `"` or `'` quotes; the content is kept verbatim.
fn unquote(arg: &str) -> Option<String> {
    let bytes = arg.as_bytes();
    if bytes.len() < 2 {
        return None;
    }
    let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
    if first == last && (first == b'"' || first == b'\'') {
        Some(arg[1..arg.len() - 1].to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(text: &str) -> (String, Action) {
        match parse_response(text) {
            ParsedResponse::Success { thought, action } => (thought, action),
            ParsedResponse::Error { reason, .. } => panic!("unexpected error: {}", reason),
        }
    }

    fn err(text: &str) -> String {
        match parse_response(text) {
            ParsedResponse::Error { raw, reason } => {
                assert_eq!(raw, text, "raw text must be kept unmodified");
                reason
            }
            ParsedResponse::Success { action, .. } => panic!("unexpected success: {}", action),
        }
    }

    #[test]
    fn test_parse_click() {
        let (thought, action) = ok("<Thought>I should click the add to cart button</Thought><Action>click(223)</Action>");
        assert_eq!(thought, "I should click the add to cart button");
        assert_eq!(
            action,
            Action::Click {
                element_id: ElementId(223)
            }
        );
    }

    #[test]
    fn test_parse_set_value_with_comma_and_spacing() {
        let (_, action) = ok("<Thought>type it</Thought>\n<Action>setValue( 7 ,  \"Main St, 5\" )</Action>");
        assert_eq!(
            action,
            Action::SetValue {
                element_id: ElementId(7),
                value: "Main St, 5".into()
            }
        );
    }

    #[test]
    fn test_parse_set_value_single_quotes() {
        let (_, action) = ok("<Thought>t</Thought><Action>setValue(3, 'abc')</Action>");
        assert_eq!(
            action,
            Action::SetValue {
                element_id: ElementId(3),
                value: "abc".into()
            }
        );
    }

    #[test]
    fn test_parse_terminal_actions() {
        assert_eq!(ok("<Thought>done</Thought><Action>finish()</Action>").1, Action::Finish);
        assert_eq!(ok("<Thought>stuck</Thought><Action>fail()</Action>").1, Action::Fail);
    }

    #[test]
    fn test_parse_multiline_thought() {
        let (thought, _) = ok("<Thought>first line\nsecond line</Thought>\n<Action>click(1)</Action>");
        assert_eq!(thought, "first line\nsecond line");
    }

    #[test]
    fn test_missing_tags() {
        assert!(err("<Action>click(1)</Action>").contains("Thought not found"));
        assert!(err("<Thought>hmm</Thought>").contains("Action not found"));
        assert!(err("Finish").contains("Thought not found"));
        assert!(err("").contains("Thought not found"));
    }

    #[test]
    fn test_unknown_action() {
        let reason = err("<Thought>t</Thought><Action>scroll(1)</Action>");
        assert_eq!(reason, "\"scroll\" is not a valid action");
    }

    #[test]
    fn test_malformed_call() {
        assert!(err("<Thought>t</Thought><Action>click 5</Action>").contains("format"));
        assert!(err("<Thought>t</Thought><Action></Action>").contains("format"));
    }

    #[test]
    fn test_wrong_arity() {
        assert!(err("<Thought>t</Thought><Action>click()</Action>").contains("expected 1 argument"));
        assert!(err("<Thought>t</Thought><Action>click(1, 2)</Action>").contains("but got 2"));
        assert!(err("<Thought>t</Thought><Action>setValue(1)</Action>").contains("expected 2"));
        assert!(err("<Thought>t</Thought><Action>finish(1)</Action>").contains("expected 0"));
    }

    #[test]
    fn test_wrong_types() {
        assert!(err("<Thought>t</Thought><Action>click(abc)</Action>").contains("expected a number"));
        assert!(err("<Thought>t</Thought><Action>click(0x1F)</Action>").contains("expected a number"));
        assert!(err("<Thought>t</Thought><Action>click(-4)</Action>").contains("expected a number"));
        assert!(err("<Thought>t</Thought><Action>click(4.5)</Action>").contains("expected a number"));
        assert!(err("<Thought>t</Thought><Action>setValue(1, hello)</Action>").contains("expected a string"));
        assert!(err("<Thought>t</Thought><Action>setValue(\"1\", \"x\")</Action>").contains("expected a number"));
    }

    #[test]
    fn test_display_reparses_to_same_action() {
        let actions = [
            Action::Click {
                element_id: ElementId(0),
            },
            Action::SetValue {
                element_id: ElementId(12),
                value: "a, b".into(),
            },
            Action::Finish,
            Action::Fail,
        ];
        for action in actions {
            let text = format!("<Thought>x</Thought><Action>{}</Action>", action);
            assert_eq!(ok(&text).1, action);
        }
    }

    #[test]
    fn test_inbound_does_not_unescape() {
        let (_, action) = ok(r#"<Thought>t</Thought><Action>setValue(2, "say \"hi\"")</Action>"#);
        assert_eq!(
            action,
            Action::SetValue {
                element_id: ElementId(2),
                value: r#"say \"hi\""#.into()
            }
        );
    }
}
