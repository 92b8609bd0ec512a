//! `%(KEY)` placeholder expansion for command templates.
//!
//! A pattern may contain `%%` for a literal percent sign and
//! `%(modifier ... KEY)` references. Modifiers apply only to non-empty
//! values: `before="text"`, `after="text"`, `upper`, `lower` and `basename`.
//! Problems never abort resolution; they are queued as diagnostics that the
//! caller drains after each call.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Something that went wrong while resolving a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateDiagnostic {
    /// The key has no value in the context; it expanded to nothing.
    UndefinedKey(String),
    /// The placeholder could not be parsed or used an unknown modifier.
    Syntax(String),
}

impl fmt::Display for TemplateDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateDiagnostic::UndefinedKey(key) => write!(f, "undefined key {key}"),
            TemplateDiagnostic::Syntax(message) => f.write_str(message),
        }
    }
}

/// Per-operation key/value map plus its diagnostic queue.
#[derive(Debug, Default, Clone)]
pub struct TemplateContext {
    values: BTreeMap<String, String>,
    diagnostics: VecDeque<TemplateDiagnostic>,
}

#[derive(Debug, PartialEq, Eq)]
enum Modifier {
    Before(String),
    After(String),
    Upper,
    Lower,
    Basename,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    /// Expand every placeholder in `pattern`.
    pub fn resolve(&mut self, pattern: &str) -> String {
        let mut out = String::with_capacity(pattern.len());
        let mut rest = pattern;

        while let Some(pos) = rest.find('%') {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos + 1..];

            if let Some(after) = tail.strip_prefix('%') {
                out.push('%');
                rest = after;
                continue;
            }

            let Some(body) = tail.strip_prefix('(') else {
                out.push('%');
                rest = tail;
                continue;
            };

            match closing_paren(body) {
                Some(end) => {
                    self.expand(&body[..end], &mut out);
                    rest = &body[end + 1..];
                }
                None => {
                    self.diagnostics.push_back(TemplateDiagnostic::Syntax(format!(
                        "unterminated placeholder in `{pattern}`"
                    )));
                    out.push_str(&rest[pos..]);
                    rest = "";
                }
            }
        }

        out.push_str(rest);
        out
    }

    pub fn has_diagnostics(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    /// Take every diagnostic queued so far.
    pub fn drain_diagnostics(&mut self) -> Vec<TemplateDiagnostic> {
        self.diagnostics.drain(..).collect()
    }

    fn expand(&mut self, body: &str, out: &mut String) {
        let tokens = match tokenize(body) {
            Ok(tokens) => tokens,
            Err(message) => {
                self.diagnostics
                    .push_back(TemplateDiagnostic::Syntax(format!("%({body}): {message}")));
                return;
            }
        };

        let Some(((key, key_value), modifiers)) = tokens.split_last() else {
            self.diagnostics
                .push_back(TemplateDiagnostic::Syntax("empty placeholder %()".to_string()));
            return;
        };
        if key_value.is_some() {
            self.diagnostics.push_back(TemplateDiagnostic::Syntax(format!(
                "%({body}): placeholder must end with a key"
            )));
            return;
        }

        let mut parsed = Vec::with_capacity(modifiers.len());
        for (name, value) in modifiers {
            match (name.as_str(), value) {
                ("before", Some(text)) => parsed.push(Modifier::Before(text.clone())),
                ("after", Some(text)) => parsed.push(Modifier::After(text.clone())),
                ("upper", None) => parsed.push(Modifier::Upper),
                ("lower", None) => parsed.push(Modifier::Lower),
                ("basename", None) => parsed.push(Modifier::Basename),
                _ => self.diagnostics.push_back(TemplateDiagnostic::Syntax(format!(
                    "%({body}): unknown modifier `{name}`"
                ))),
            }
        }

        let Some(value) = self.values.get(key.as_str()) else {
            self.diagnostics
                .push_back(TemplateDiagnostic::UndefinedKey(key.clone()));
            return;
        };
        if value.is_empty() {
            return;
        }

        let mut value = value.clone();
        let mut prefix = String::new();
        let mut suffix = String::new();
        for modifier in parsed {
            match modifier {
                Modifier::Before(text) => prefix.push_str(&text),
                Modifier::After(text) => suffix.push_str(&text),
                Modifier::Upper => value.make_ascii_uppercase(),
                Modifier::Lower => value.make_ascii_lowercase(),
                Modifier::Basename => {
                    let base = value
                        .trim_end_matches('/')
                        .rsplit('/')
                        .next()
                        .unwrap_or_default()
                        .to_string();
                    value = base;
                }
            }
        }
        out.push_str(&prefix);
        out.push_str(&value);
        out.push_str(&suffix);
    }
}

/// Byte offset of the `)` closing a placeholder body, honouring quotes.
fn closing_paren(body: &str) -> Option<usize> {
    let mut quoted = false;
    let mut escaped = false;
    for (index, ch) in body.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ')' if !quoted => return Some(index),
            _ => {}
        }
    }
    None
}

/// Split a placeholder body into `name` and `name="value"` tokens.
fn tokenize(body: &str) -> Result<Vec<(String, Option<String>)>, String> {
    let mut tokens = Vec::new();
    let mut chars = body.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut name = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_alphanumeric() || *c == '_') {
            name.push(c);
        }
        if name.is_empty() {
            let found = chars.peek().copied().unwrap_or_default();
            return Err(format!("unexpected character `{found}`"));
        }

        if chars.next_if_eq(&'=').is_none() {
            tokens.push((name, None));
            continue;
        }
        if chars.next_if_eq(&'"').is_none() {
            return Err(format!("value of `{name}` must be quoted"));
        }

        let mut value = String::new();
        let mut closed = false;
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                }
                '"' => {
                    closed = true;
                    break;
                }
                other => value.push(other),
            }
        }
        if !closed {
            return Err(format!("unterminated quote in `{name}`"));
        }
        tokens.push((name, Some(value)));
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TemplateContext {
        let mut ctx = TemplateContext::new();
        ctx.set("MNTPT", "/home/alice/share");
        ctx.set("SERVER", "Files");
        ctx.set("OPTIONS", "ro,nosuid");
        ctx.set("EMPTY", "");
        ctx
    }

    #[test]
    fn resolves_plain_keys_and_literals() {
        let mut ctx = context();
        assert_eq!(ctx.resolve("//%(SERVER)/x"), "//Files/x");
        assert_eq!(ctx.resolve("100%% of %(MNTPT)"), "100% of /home/alice/share");
        assert_eq!(ctx.resolve("50% off"), "50% off");
        assert!(!ctx.has_diagnostics());
    }

    #[test]
    fn resolution_is_deterministic() {
        let mut ctx = context();
        let pattern = "%(before=\"-o\" OPTIONS) %(lower SERVER)";
        let first = ctx.resolve(pattern);
        assert_eq!(first, ctx.resolve(pattern));
        assert_eq!(first, "-oro,nosuid files");
    }

    #[test]
    fn modifiers_apply_only_to_non_empty_values() {
        let mut ctx = context();
        assert_eq!(ctx.resolve("x%(before=\",\" OPTIONS)"), "x,ro,nosuid");
        assert_eq!(ctx.resolve("x%(before=\",\" EMPTY)"), "x");
        assert_eq!(ctx.resolve("%(upper after=\"!\" SERVER)"), "FILES!");
        assert_eq!(ctx.resolve("%(basename MNTPT)"), "share");
        assert!(!ctx.has_diagnostics());
    }

    #[test]
    fn quoted_values_may_contain_parens_and_quotes() {
        let mut ctx = context();
        assert_eq!(ctx.resolve("%(before=\"(\\\"\" after=\")\" SERVER)"), "(\"Files)");
    }

    #[test]
    fn undefined_key_expands_empty_and_queues_diagnostic() {
        let mut ctx = context();
        assert_eq!(ctx.resolve("a%(NOPE)b"), "ab");
        assert_eq!(
            ctx.drain_diagnostics(),
            vec![TemplateDiagnostic::UndefinedKey("NOPE".to_string())]
        );
        assert!(ctx.drain_diagnostics().is_empty());
    }

    #[test]
    fn malformed_placeholders_are_reported() {
        let mut ctx = context();
        assert_eq!(ctx.resolve("x %(SERVER"), "x %(SERVER");
        assert_eq!(ctx.resolve("%(shout SERVER)"), "Files");
        assert_eq!(ctx.resolve("%(before=\"x\")"), "");
        assert_eq!(ctx.resolve("%()"), "");
        let diagnostics = ctx.drain_diagnostics();
        assert_eq!(diagnostics.len(), 4);
        assert!(diagnostics
            .iter()
            .all(|d| matches!(d, TemplateDiagnostic::Syntax(_))));
        assert!(diagnostics[1].to_string().contains("unknown modifier `shout`"));
    }

    #[test]
    fn set_replaces_existing_value() {
        let mut ctx = context();
        ctx.set("SERVER", "other");
        assert_eq!(ctx.get("SERVER"), Some("other"));
        assert_eq!(ctx.remove("SERVER").as_deref(), Some("other"));
        assert_eq!(ctx.get("SERVER"), None);
    }
}
