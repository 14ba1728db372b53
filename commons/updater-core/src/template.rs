use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Request-scoped variables offered to a contextual template.
pub type Vars = BTreeMap<String, String>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template evaluation error: invalid action {action:?}: {reason}")]
    Syntax { action: String, reason: &'static str },

    #[error("template evaluation error: variable {0:?} requested but no variables were supplied")]
    NoVariables(String),

    #[error("template evaluation error: variable {0:?} is not defined")]
    MissingVariable(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TemplatePart {
    Literal(String),
    Var(String),
}

/// A string with holes that are filled from a [`Vars`] map at call time.
///
/// The textual form is `{{ index .Vars "key" }}` for each hole.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextualTemplate {
    parts: Vec<TemplatePart>,
}

impl ContextualTemplate {
    pub fn from_parts(parts: Vec<TemplatePart>) -> Self {
        let mut template = Self::default();
        for part in parts {
            match part {
                TemplatePart::Literal(text) => template.push_literal(&text),
                TemplatePart::Var(key) => template.push_var(key),
            }
        }
        template
    }

    pub fn push_literal(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.parts.last_mut() {
            Some(TemplatePart::Literal(prev)) => prev.push_str(text),
            _ => self.parts.push(TemplatePart::Literal(text.to_string())),
        }
    }

    pub fn push_var(&mut self, key: impl Into<String>) {
        self.parts.push(TemplatePart::Var(key.into()));
    }

    pub fn parts(&self) -> &[TemplatePart] {
        &self.parts
    }

    /// True when at least one hole has to be filled at evaluation time.
    pub fn is_contextual(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, TemplatePart::Var(_)))
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            TemplatePart::Var(key) => Some(key.as_str()),
            TemplatePart::Literal(_) => None,
        })
    }

    /// Literal text of a template without holes.
    pub fn as_literal(&self) -> Option<String> {
        if self.is_contextual() {
            return None;
        }
        Some(
            self.parts
                .iter()
                .filter_map(|p| match p {
                    TemplatePart::Literal(text) => Some(text.as_str()),
                    TemplatePart::Var(_) => None,
                })
                .collect(),
        )
    }

    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let mut template = Self::default();
        let mut rest = raw;
        while let Some(start) = rest.find("{{") {
            template.push_literal(&rest[..start]);
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find("}}") else {
                return Err(TemplateError::Syntax {
                    action: rest[start..].to_string(),
                    reason: "unclosed action",
                });
            };
            let action = &after_open[..end];
            template.push_var(parse_index_action(action)?);
            rest = &after_open[end + 2..];
        }
        template.push_literal(rest);
        Ok(template)
    }

    pub fn evaluate(&self, vars: Option<&Vars>) -> Result<String, TemplateError> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Literal(text) => out.push_str(text),
                TemplatePart::Var(key) => {
                    let vars = vars.ok_or_else(|| TemplateError::NoVariables(key.clone()))?;
                    let value = vars
                        .get(key)
                        .ok_or_else(|| TemplateError::MissingVariable(key.clone()))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for ContextualTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.parts {
            match part {
                TemplatePart::Literal(text) => f.write_str(text)?,
                TemplatePart::Var(key) => {
                    f.write_str("{{ index .Vars \"")?;
                    for c in key.chars() {
                        if c == '"' || c == '\\' {
                            f.write_str("\\")?;
                        }
                        write!(f, "{c}")?;
                    }
                    f.write_str("\" }}")?;
                }
            }
        }
        Ok(())
    }
}

/// Evaluate a deferred template with the variables of the current request.
pub fn evaluate_contextual(
    template: &ContextualTemplate,
    vars: Option<&Vars>,
) -> Result<String, TemplateError> {
    template.evaluate(vars)
}

/// Parse and evaluate a template given in its textual form.
pub fn evaluate_contextual_str(raw: &str, vars: Option<&Vars>) -> Result<String, TemplateError> {
    ContextualTemplate::parse(raw)?.evaluate(vars)
}

fn parse_index_action(action: &str) -> Result<String, TemplateError> {
    let syntax = |reason| TemplateError::Syntax {
        action: action.to_string(),
        reason,
    };
    let body = action.trim();
    let body = body
        .strip_prefix("index")
        .filter(|b| b.starts_with(char::is_whitespace))
        .ok_or_else(|| syntax("only `index .Vars \"key\"` is supported"))?
        .trim_start();
    let body = body
        .strip_prefix(".Vars")
        .filter(|b| b.starts_with(char::is_whitespace))
        .ok_or_else(|| syntax("index target must be .Vars"))?
        .trim_start();
    let quoted = body
        .strip_prefix('"')
        .ok_or_else(|| syntax("key must be a quoted string"))?;

    let mut key = String::new();
    let mut chars = quoted.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, escaped)) => key.push(escaped),
                None => return Err(syntax("unterminated escape")),
            },
            '"' => {
                if !quoted[i + 1..].trim().is_empty() {
                    return Err(syntax("unexpected tokens after key"));
                }
                return Ok(key);
            }
            other => key.push(other),
        }
    }
    Err(syntax("unterminated key string"))
}
