//! Parameter Templates
//!
//! Task parameters are strings with `{field}` placeholders that are filled
//! from a logical window when a run is created. `{{` and `}}` produce
//! literal braces.
//!
//! # Example
//! ```
//! use ingestrunner::workflow::template::placeholders;
//!
//! let names = placeholders("raw/{dataset}/{year}/{dataset}_{year-month}.{format}").unwrap();
//! assert_eq!(names, vec!["dataset", "year", "year-month", "format"]);
//! ```

use std::collections::BTreeMap;

use thiserror::Error;

use crate::schedule::{LogicalWindow, WINDOW_FIELDS};

/// Malformed template or unresolvable placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unterminated placeholder in '{0}'")]
    Unterminated(String),

    #[error("unmatched '}}' in '{0}'")]
    UnmatchedBrace(String),

    #[error("empty placeholder in '{0}'")]
    EmptyPlaceholder(String),

    #[error("unknown field '{{{0}}}'")]
    UnknownField(String),
}

/// A template failure attributed to one parameter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parameter '{param}': {source}")]
pub struct ResolveError {
    pub param: String,
    #[source]
    pub source: TemplateError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

fn parse_segments(template: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.char_indices().peekable();

    while let Some((index, ch)) = chars.next() {
        match ch {
            '{' => {
                if matches!(chars.peek(), Some((_, '{'))) {
                    chars.next();
                    literal.push('{');
                    continue;
                }

                let start = index + 1;
                let mut end = None;
                for (j, c) in chars.by_ref() {
                    match c {
                        '}' => {
                            end = Some(j);
                            break;
                        }
                        '{' => return Err(TemplateError::Unterminated(template.to_string())),
                        _ => {}
                    }
                }
                let end = end.ok_or_else(|| TemplateError::Unterminated(template.to_string()))?;

                let name = template[start..end].trim();
                if name.is_empty() {
                    return Err(TemplateError::EmptyPlaceholder(template.to_string()));
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Field(name.to_string()));
            }
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                    literal.push('}');
                } else {
                    return Err(TemplateError::UnmatchedBrace(template.to_string()));
                }
            }
            _ => literal.push(ch),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Returns the distinct placeholder names of a template, in order of first use.
pub fn placeholders(template: &str) -> Result<Vec<String>, TemplateError> {
    let mut names: Vec<String> = Vec::new();
    for segment in parse_segments(template)? {
        if let Segment::Field(name) = segment {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    Ok(names)
}

/// Checks if a string contains at least one placeholder.
pub fn has_placeholders(text: &str) -> bool {
    placeholders(text).map(|names| !names.is_empty()).unwrap_or(false)
}

/// Renders a template, looking each placeholder up with `lookup`.
pub fn render<F>(template: &str, lookup: F) -> Result<String, TemplateError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut output = String::with_capacity(template.len());
    for segment in parse_segments(template)? {
        match segment {
            Segment::Literal(text) => output.push_str(&text),
            Segment::Field(name) => {
                let value = lookup(&name).ok_or(TemplateError::UnknownField(name))?;
                output.push_str(&value);
            }
        }
    }
    Ok(output)
}

/// Values available to task parameters for one window.
///
/// Precedence, highest first: window fields, definition parameters,
/// process variables. Definition parameters may themselves reference
/// window fields and process variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    values: BTreeMap<String, String>,
}

impl TemplateContext {
    pub fn for_window(
        window: &LogicalWindow,
        params: &BTreeMap<String, String>,
        variables: &BTreeMap<String, String>,
    ) -> Result<Self, ResolveError> {
        let base = |name: &str| window.field(name).or_else(|| variables.get(name).cloned());

        let mut values = variables.clone();
        for (key, template) in params {
            let value = render(template, base).map_err(|source| ResolveError {
                param: key.clone(),
                source,
            })?;
            values.insert(key.clone(), value);
        }
        for name in WINDOW_FIELDS {
            if let Some(value) = window.field(name) {
                values.insert((*name).to_string(), value);
            }
        }

        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        render(template, |name| self.values.get(name).cloned())
    }

    /// Resolves a whole parameter mapping.
    pub fn resolve(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, ResolveError> {
        params
            .iter()
            .map(|(key, template)| {
                self.render(template)
                    .map(|value| (key.clone(), value))
                    .map_err(|source| ResolveError {
                        param: key.clone(),
                        source,
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn window() -> LogicalWindow {
        LogicalWindow::new(Utc.with_ymd_and_hms(2019, 2, 2, 6, 0, 0).unwrap())
    }

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders("reads/{sample}.csv").unwrap(), vec!["sample"]);
        assert_eq!(
            placeholders("{a}_{b}_{a}").unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(placeholders("plain.txt").unwrap().is_empty());
    }

    #[test]
    fn test_has_placeholders() {
        assert!(has_placeholders("{year}/x"));
        assert!(!has_placeholders("no_fields.csv"));
        assert!(!has_placeholders("{{escaped}}"));
        assert!(!has_placeholders("{broken"));
    }

    #[test]
    fn test_render_with_escapes() {
        let out = render("{{literal}} {x}", |n| (n == "x").then(|| "1".to_string())).unwrap();
        assert_eq!(out, "{literal} 1");
    }

    #[test]
    fn test_malformed_templates() {
        assert!(matches!(
            placeholders("{year"),
            Err(TemplateError::Unterminated(_))
        ));
        assert!(matches!(
            placeholders("year}"),
            Err(TemplateError::UnmatchedBrace(_))
        ));
        assert!(matches!(
            placeholders("a{}b"),
            Err(TemplateError::EmptyPlaceholder(_))
        ));
        assert!(matches!(
            placeholders("{a{b}}"),
            Err(TemplateError::Unterminated(_))
        ));
    }

    #[test]
    fn test_unknown_field() {
        let err = render("{nope}", |_| None).unwrap_err();
        assert_eq!(err, TemplateError::UnknownField("nope".to_string()));
        assert_eq!(err.to_string(), "unknown field '{nope}'");
    }

    #[test]
    fn test_context_object_key() {
        let params = map(&[("dataset", "yellow_tripdata"), ("format", "parquet")]);
        let ctx = TemplateContext::for_window(&window(), &params, &BTreeMap::new()).unwrap();
        let key = ctx
            .render("raw/{dataset}/{year}/{dataset}_{year-month}.{format}")
            .unwrap();
        assert_eq!(key, "raw/yellow_tripdata/2019/yellow_tripdata_2019-02.parquet");
    }

    #[test]
    fn test_params_reference_window_and_variables() {
        let params = map(&[("local_file", "{work_dir}/zones_{year-month}.csv")]);
        let vars = map(&[("work_dir", "/opt/ingest")]);
        let ctx = TemplateContext::for_window(&window(), &params, &vars).unwrap();
        assert_eq!(ctx.get("local_file"), Some("/opt/ingest/zones_2019-02.csv"));
    }

    #[test]
    fn test_params_cannot_reference_each_other() {
        let params = map(&[("a", "x"), ("b", "{a}")]);
        let err = TemplateContext::for_window(&window(), &params, &BTreeMap::new()).unwrap_err();
        assert_eq!(err.param, "b");
    }

    #[test]
    fn test_window_fields_take_precedence() {
        let vars = map(&[("year", "1999")]);
        let ctx = TemplateContext::for_window(&window(), &BTreeMap::new(), &vars).unwrap();
        assert_eq!(ctx.get("year"), Some("2019"));
    }

    #[test]
    fn test_resolution_is_pure() {
        let params = map(&[("dataset", "fhv_tripdata")]);
        let task = map(&[
            ("source", "https://host/{dataset}_{year-month}.parquet"),
            ("destination", "/tmp/{dataset}_{ts_nodash}.parquet"),
        ]);
        let first = TemplateContext::for_window(&window(), &params, &BTreeMap::new())
            .unwrap()
            .resolve(&task)
            .unwrap();
        let second = TemplateContext::for_window(&window(), &params, &BTreeMap::new())
            .unwrap()
            .resolve(&task)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first["source"], "https://host/fhv_tripdata_2019-02.parquet");
    }
}
