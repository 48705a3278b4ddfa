//! Structural comparison of two values of the same shape.
//!
//! Both values are compared through their JSON representation, object keys
//! in sorted order, so the same pair always yields the same report.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// One step of the path to a compared leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathStep {
    Field(String),
    Index(usize),
}

impl fmt::Display for PathStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathStep::Field(name) => write!(f, ".{}", name),
            PathStep::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// A leaf at which the two compared values differ.
#[derive(Clone, Debug, PartialEq)]
pub struct DiffItem {
    pub path: String,
    /// Value of the first (desired) side, `None` if absent.
    pub a: Option<Value>,
    /// Value of the second (latest) side, `None` if absent.
    pub b: Option<Value>,
}

impl fmt::Display for DiffItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (x: {} y: {})",
            self.path,
            display_value(self.a.as_ref()),
            display_value(self.b.as_ref())
        )
    }
}

fn display_value(v: Option<&Value>) -> String {
    match v {
        None => "<nil>".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CompareOptions {
    /// Treat null, absent, `[]` and `{}` as equal.
    pub equate_empty: bool,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self { equate_empty: true }
    }
}

/// Collects the differences found while walking two values.
#[derive(Clone, Debug, Default)]
pub struct Reporter {
    path: Vec<PathStep>,
    differences: Vec<DiffItem>,
}

impl Reporter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push_step(&mut self, step: PathStep) {
        self.path.push(step);
    }

    pub fn pop_step(&mut self) {
        self.path.pop();
    }

    /// Records the current path unless `equal`.
    pub fn report(&mut self, a: Option<&Value>, b: Option<&Value>, equal: bool) {
        if !equal {
            self.differences.push(DiffItem {
                path: self.current_path(),
                a: a.cloned(),
                b: b.cloned(),
            });
        }
    }

    fn current_path(&self) -> String {
        if self.path.is_empty() {
            return ".".to_string();
        }
        self.path.iter().map(|s| s.to_string()).collect()
    }

    pub fn differences(&self) -> &[DiffItem] {
        &self.differences
    }

    pub fn is_empty(&self) -> bool {
        self.differences.is_empty()
    }

    pub fn len(&self) -> usize {
        self.differences.len()
    }

    /// Whether any difference is at or below `prefix`, e.g. `.tags`.
    pub fn has_changed(&self, prefix: &str) -> bool {
        self.differences.iter().any(|d| {
            d.path == prefix
                || d.path
                    .strip_prefix(prefix)
                    .map_or(false, |rest| rest.starts_with('.') || rest.starts_with('['))
        })
    }
}

impl fmt::Display for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.differences.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

/// Compare `a` and `b` and return the report.
pub fn diff<T: Serialize>(a: &T, b: &T, options: CompareOptions) -> Result<Reporter, serde_json::Error> {
    let a = serde_json::to_value(a)?;
    let b = serde_json::to_value(b)?;
    let mut reporter = Reporter::new();
    compare(Some(&a), Some(&b), options, &mut reporter);
    Ok(reporter)
}

/// Whether `a` and `b` are equal under `options`.
pub fn equal<T: Serialize>(a: &T, b: &T, options: CompareOptions) -> Result<bool, serde_json::Error> {
    Ok(diff(a, b, options)?.is_empty())
}

fn normalize(v: Option<&Value>, options: CompareOptions) -> Option<&Value> {
    match v {
        None | Some(Value::Null) => None,
        Some(Value::Array(a)) if options.equate_empty && a.is_empty() => None,
        Some(Value::Object(o)) if options.equate_empty && o.is_empty() => None,
        Some(Value::String(s)) if options.equate_empty && s.is_empty() => None,
        v => v,
    }
}

/// Walk `a` and `b` recursively, reporting every differing leaf to `reporter`.
pub fn compare(a: Option<&Value>, b: Option<&Value>, options: CompareOptions, reporter: &mut Reporter) {
    let a = normalize(a, options);
    let b = normalize(b, options);
    match (a, b) {
        (None, None) => (),
        (Some(Value::Object(x)), Some(Value::Object(y))) => {
            let mut keys: Vec<&String> = x.keys().chain(y.keys()).collect();
            keys.sort();
            keys.dedup();
            for k in keys {
                reporter.push_step(PathStep::Field(k.clone()));
                compare(x.get(k), y.get(k), options, reporter);
                reporter.pop_step();
            }
        }
        (Some(Value::Object(x)), None) => {
            let mut keys: Vec<&String> = x.keys().collect();
            keys.sort();
            for k in keys {
                reporter.push_step(PathStep::Field(k.clone()));
                compare(x.get(k), None, options, reporter);
                reporter.pop_step();
            }
        }
        (None, Some(Value::Object(y))) => {
            let mut keys: Vec<&String> = y.keys().collect();
            keys.sort();
            for k in keys {
                reporter.push_step(PathStep::Field(k.clone()));
                compare(None, y.get(k), options, reporter);
                reporter.pop_step();
            }
        }
        (Some(Value::Array(x)), Some(Value::Array(y))) => {
            for i in 0..x.len().max(y.len()) {
                reporter.push_step(PathStep::Index(i));
                compare(x.get(i), y.get(i), options, reporter);
                reporter.pop_step();
            }
        }
        (a, b) => reporter.report(a, b, a == b),
    }
}
