//! `{{ ... }}` template rendering for names, descriptions and keys.
//!
//! Templates are rendered with minijinja. Supported expressions:
//! - `{{timestamp}}`: unix seconds
//! - `{{isotime}}`: RFC3339 time
//! - `{{uuid}}`: a random v4 uuid, one per render
//! - `{{ .Name }}`: a data variable such as `BuildRegion` or `SourceAMI`
//!
//! Any expression may be piped through `clean_resource_name`.

use super::validate::clean_resource_name;
use chrono::{DateTime, SecondsFormat, Utc};
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Data variables published after launch.
pub const GENERATED_DATA_KEYS: [&str; 4] = [
    "BuildRegion",
    "SourceAMI",
    "SourceAMIName",
    "SourceAMICreationDate",
];

/// `{{ .Name` as written in build templates; the dot is dropped before rendering.
static DOTTED_VARIABLE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\{\{(-?\s*)\.([A-Za-z_][A-Za-z0-9_]*)").ok());

/// Error rendering a template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// Malformed template, such as a `{{` without its closing `}}`.
    #[error("template syntax error: {0}")]
    Syntax(String),

    /// A function or data variable the context does not know.
    #[error("unknown template variable {0:?}")]
    UnknownVariable(String),

    /// A pipe stage that is not a known filter.
    #[error("unknown template filter: {0}")]
    UnknownFilter(String),

    /// Any other rendering failure.
    #[error("template render error: {0}")]
    Render(String),
}

impl From<minijinja::Error> for TemplateError {
    fn from(err: minijinja::Error) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::SyntaxError => Self::Syntax(message),
            ErrorKind::UnknownFilter => Self::UnknownFilter(message),
            ErrorKind::UndefinedError => Self::UnknownVariable(message),
            _ => Self::Render(message),
        }
    }
}

/// Values available while rendering.
#[derive(Debug, Clone)]
pub struct RenderContext {
    data: BTreeMap<String, String>,
    now: DateTime<Utc>,
}

impl Default for RenderContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Render,
    Validate,
}

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env.add_filter("clean_resource_name", |value: String| clean_resource_name(&value));
    env
}

fn normalize(template: &str) -> String {
    match DOTTED_VARIABLE.as_ref() {
        Some(re) => re.replace_all(template, "{{${1}${2}").into_owned(),
        None => template.to_string(),
    }
}

impl RenderContext {
    /// Creates a context pinned to the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
            now: Utc::now(),
        }
    }

    /// Pins the time used by `timestamp` and `isotime`.
    #[must_use]
    pub const fn with_time(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Adds a data variable.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Adds every entry of `data` as a variable.
    #[must_use]
    pub fn with_all_data(mut self, data: &BTreeMap<String, String>) -> Self {
        self.data
            .extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Renders `template`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] on malformed expressions or unknown names.
    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        self.process(template, Mode::Render)
    }

    /// Checks syntax and names without requiring data variables to be set.
    ///
    /// # Errors
    ///
    /// See [`RenderContext::render`].
    pub fn validate(&self, template: &str) -> Result<(), TemplateError> {
        self.process(template, Mode::Validate).map(|_| ())
    }

    fn variables(&self, mode: Mode) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        if mode == Mode::Validate {
            for key in GENERATED_DATA_KEYS {
                vars.insert(key.to_string(), String::new());
            }
        }
        vars.extend(self.data.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.insert("timestamp".to_string(), self.now.timestamp().to_string());
        vars.insert(
            "isotime".to_string(),
            self.now.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        vars.insert("uuid".to_string(), Uuid::new_v4().to_string());
        vars
    }

    fn process(&self, template: &str, mode: Mode) -> Result<String, TemplateError> {
        if !template.contains("{{") && !template.contains("{%") {
            return Ok(template.to_string());
        }
        let source = normalize(template);
        let env = environment();
        let compiled = env.template_from_str(&source)?;
        let vars = self.variables(mode);

        let mut unknown: Vec<String> = compiled
            .undeclared_variables(false)
            .into_iter()
            .filter(|name| !vars.contains_key(name))
            .collect();
        unknown.sort();
        if let Some(name) = unknown.into_iter().next() {
            return Err(TemplateError::UnknownVariable(name));
        }

        Ok(compiled.render(&vars)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed() -> RenderContext {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        RenderContext::new().with_time(now)
    }

    #[test]
    fn test_timestamp_and_isotime() {
        let ctx = fixed();
        assert_eq!(ctx.render("prefix-{{timestamp}}").unwrap(), "prefix-1709296200");
        assert_eq!(ctx.render("{{ isotime }}").unwrap(), "2024-03-01T12:30:00Z");
    }

    #[test]
    fn test_data_variables() {
        let ctx = fixed()
            .with_data("BuildRegion", "us-east-1")
            .with_data("SourceAMI", "ami-123");
        assert_eq!(
            ctx.render("built in {{ .BuildRegion }} from {{.SourceAMI}}").unwrap(),
            "built in us-east-1 from ami-123"
        );
    }

    #[test]
    fn test_clean_resource_name_filter() {
        let ctx = fixed();
        assert_eq!(
            ctx.render("img {{ isotime | clean_resource_name }}").unwrap(),
            "img 2024-03-01T12-30-00Z"
        );
    }

    #[test]
    fn test_unknown_names_rejected() {
        let ctx = fixed();
        assert_eq!(
            ctx.render("{{ nope }}"),
            Err(TemplateError::UnknownVariable("nope".to_string()))
        );
        assert_eq!(
            ctx.render("{{ .Missing }}"),
            Err(TemplateError::UnknownVariable("Missing".to_string()))
        );
        assert!(matches!(
            ctx.render("{{ uuid | shout }}"),
            Err(TemplateError::UnknownFilter(_))
        ));
        assert!(matches!(ctx.render("{{ uuid"), Err(TemplateError::Syntax(_))));
    }

    #[test]
    fn test_validate_allows_generated_data() {
        let ctx = fixed();
        assert!(ctx.validate("{{ .SourceAMIName }}-copy").is_ok());
        assert!(ctx.validate("{{ .Other }}").is_err());
    }

    #[test]
    fn test_plain_text_and_whitespace_are_kept() {
        let ctx = fixed().with_data("SourceAMIName", "base");
        assert_eq!(ctx.render("no templates here").unwrap(), "no templates here");
        assert_eq!(
            ctx.render("{{- .SourceAMIName }}-copy\n").unwrap(),
            "base-copy\n"
        );
    }

    #[test]
    fn test_uuid_is_random() {
        let ctx = fixed();
        assert_ne!(ctx.render("{{uuid}}").unwrap(), ctx.render("{{uuid}}").unwrap());
    }
}
