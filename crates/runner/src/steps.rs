//! Step pattern registry
//!
//! Driver step patterns such as `open the browser at (url:string)` are
//! compiled once per [`StepRegistry::load`] into anchored regexes with typed
//! capture slots. Resolution walks a snapshot of the matcher table without
//! holding any lock.

use parking_lot::RwLock;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use stepwise_common::{Error, ParamSpec, ParamType, Result, StepDefinition};
use tracing::{debug, info};

/// A step text resolved to a single definition
#[derive(Debug, Clone)]
pub struct StepMatch {
    pub definition: Arc<StepDefinition>,
    /// Captured values, coerced to their declared types
    pub params: Map<String, Value>,
}

impl StepMatch {
    pub fn driver_id(&self) -> &str {
        &self.definition.driver_id
    }

    pub fn action(&self) -> &str {
        &self.definition.action
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Placeholder {
        name: String,
        param_type: Option<ParamType>,
    },
}

#[derive(Debug, Clone)]
struct Slot {
    name: String,
    param_type: ParamType,
}

/// One anchored piece of a pattern, used when the lazy split fails to coerce
#[derive(Debug)]
enum Part {
    Literal(Regex),
    Capture(usize, Regex),
}

/// A compiled step pattern
#[derive(Debug)]
struct CompiledStep {
    definition: Arc<StepDefinition>,
    regex: Regex,
    slots: Vec<Slot>,
    literal_chars: usize,
    /// Present only when a regex slot makes other splits worth trying
    parts: Option<Vec<Part>>,
}

impl CompiledStep {
    fn compile(definition: StepDefinition) -> std::result::Result<Self, String> {
        if definition.action.trim().is_empty() {
            return Err("step has no action".to_string());
        }

        let segments = tokenize(&definition.pattern)?;
        let mut source = String::from("^");
        let mut slots = Vec::new();
        let mut literal_chars = 0;
        let mut previous_placeholder = false;
        let mut parts = Vec::new();

        for segment in &segments {
            match segment {
                Segment::Literal(text) => {
                    literal_chars += text.chars().count();
                    let literal = literal_regex(text);
                    parts.push(Part::Literal(anchored(&format!("^(?:{})", literal))?));
                    source.push_str(&literal);
                    previous_placeholder = false;
                }
                Segment::Placeholder { name, param_type } => {
                    if previous_placeholder {
                        return Err(format!(
                            "placeholder '{}' directly follows another placeholder",
                            name
                        ));
                    }
                    if slots.iter().any(|s: &Slot| &s.name == name) {
                        return Err(format!("duplicate placeholder '{}'", name));
                    }
                    let param_type = param_type
                        .or_else(|| declared_type(&definition.parameters, name))
                        .unwrap_or_default();
                    let capture = capture_regex(param_type);
                    parts.push(Part::Capture(
                        slots.len(),
                        anchored(&format!("^(?:{})$", capture))?,
                    ));
                    source.push_str(capture);
                    slots.push(Slot {
                        name: name.clone(),
                        param_type,
                    });
                    previous_placeholder = true;
                }
            }
        }
        source.push('$');

        let regex = anchored(&source)?;
        let parts = slots
            .iter()
            .any(|s| s.param_type == ParamType::Regex)
            .then_some(parts);

        Ok(Self {
            definition: Arc::new(definition),
            regex,
            slots,
            literal_chars,
            parts,
        })
    }

    /// Match step text; `None` when literals don't align or no split of the
    /// text gives captures that all coerce
    fn matches(&self, text: &str) -> Option<Map<String, Value>> {
        let captures = self.regex.captures(text)?;
        let lazy = self.coerce_captures(&captures);
        if lazy.is_some() {
            return lazy;
        }

        let parts = self.parts.as_deref()?;
        let mut params = Map::new();
        self.search(parts, text, &mut params).then_some(params)
    }

    fn coerce_captures(&self, captures: &regex::Captures<'_>) -> Option<Map<String, Value>> {
        let mut params = Map::new();
        for (i, slot) in self.slots.iter().enumerate() {
            let raw = captures.get(i + 1)?.as_str();
            params.insert(slot.name.clone(), coerce(raw, slot.param_type)?);
        }
        Some(params)
    }

    /// Try every capture end from shortest to longest, so the lazy
    /// preference still decides between valid splits
    fn search(&self, parts: &[Part], text: &str, params: &mut Map<String, Value>) -> bool {
        let Some((part, rest)) = parts.split_first() else {
            return text.is_empty();
        };
        match part {
            Part::Literal(regex) => match regex.find(text) {
                Some(m) => self.search(rest, &text[m.end()..], params),
                None => false,
            },
            Part::Capture(index, regex) => {
                let slot = &self.slots[*index];
                let ends = text
                    .char_indices()
                    .skip(1)
                    .map(|(i, _)| i)
                    .chain(std::iter::once(text.len()));
                for end in ends {
                    let raw = &text[..end];
                    if !regex.is_match(raw) {
                        continue;
                    }
                    let Some(value) = coerce(raw, slot.param_type) else {
                        continue;
                    };
                    params.insert(slot.name.clone(), value);
                    if self.search(rest, &text[end..], params) {
                        return true;
                    }
                    params.remove(&slot.name);
                }
                false
            }
        }
    }
}

fn anchored(source: &str) -> std::result::Result<Regex, String> {
    Regex::new(source).map_err(|e| e.to_string())
}

fn declared_type(parameters: &[ParamSpec], name: &str) -> Option<ParamType> {
    parameters
        .iter()
        .find(|p| p.name == name)
        .map(|p| p.param_type)
}

/// Split a pattern into literal and placeholder segments.
/// `\(`, `\)` and `\\` produce literal characters.
fn tokenize(pattern: &str) -> std::result::Result<Vec<Segment>, String> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err("pattern is empty".to_string());
    }

    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped @ ('(' | ')' | '\\')) => literal.push(escaped),
                Some(other) => {
                    literal.push('\\');
                    literal.push(other);
                }
                None => literal.push('\\'),
            },
            '(' => {
                let mut inner = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    match c {
                        ')' => {
                            closed = true;
                            break;
                        }
                        '(' => return Err("nested '(' inside placeholder".to_string()),
                        _ => inner.push(c),
                    }
                }
                if !closed {
                    return Err("unbalanced '(' in pattern".to_string());
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(parse_placeholder(&inner)?);
            }
            ')' => return Err("unbalanced ')' in pattern".to_string()),
            _ => literal.push(c),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn parse_placeholder(inner: &str) -> std::result::Result<Segment, String> {
    let (name, param_type) = match inner.split_once(':') {
        Some((name, ty)) => (name.trim(), Some(ty.parse::<ParamType>()?)),
        None => (inner.trim(), None),
    };

    let valid = name
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(format!("invalid placeholder name '{}'", name));
    }

    Ok(Segment::Placeholder {
        name: name.to_string(),
        param_type,
    })
}

/// Literal text matches exactly, except that any whitespace run matches any other
fn literal_regex(text: &str) -> String {
    let mut out = String::new();
    let mut in_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push_str(r"\s+");
            }
            in_space = true;
        } else {
            out.push_str(&regex::escape(&c.to_string()));
            in_space = false;
        }
    }
    out
}

fn capture_regex(param_type: ParamType) -> &'static str {
    match param_type {
        ParamType::Int => r"([-+]?\d+)",
        ParamType::Float => r"([-+]?\d+(?:\.\d+)?)",
        ParamType::String | ParamType::Regex => r#"("[^"]*"|'[^']*'|.+?)"#,
    }
}

fn strip_quotes(raw: &str) -> &str {
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return &raw[1..raw.len() - 1];
        }
    }
    raw
}

fn coerce(raw: &str, param_type: ParamType) -> Option<Value> {
    match param_type {
        ParamType::Int => raw.parse::<i64>().ok().map(Value::from),
        ParamType::Float => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        ParamType::String => Some(Value::String(strip_quotes(raw).to_string())),
        ParamType::Regex => {
            let source = strip_quotes(raw);
            Regex::new(source).ok()?;
            Some(Value::String(source.to_string()))
        }
    }
}

/// Compiled matchers of every loaded driver
#[derive(Debug, Default)]
struct MatcherTable {
    drivers: BTreeMap<String, Vec<Arc<CompiledStep>>>,
}

/// Registry of compiled step definitions
#[derive(Debug, Default)]
pub struct StepRegistry {
    table: RwLock<Arc<MatcherTable>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace every definition of a driver. The batch is
    /// compiled up front and swapped in only if every pattern compiles.
    pub fn load(&self, driver_id: &str, definitions: Vec<StepDefinition>) -> Result<usize> {
        let mut compiled = Vec::with_capacity(definitions.len());
        let mut ids = HashSet::new();

        for mut definition in definitions {
            definition.driver_id = driver_id.to_string();
            let step_id = definition.id.clone();
            if !ids.insert(step_id.clone()) {
                return Err(Error::PatternCompile {
                    driver_id: driver_id.to_string(),
                    step_id,
                    reason: "duplicate step id".to_string(),
                });
            }
            let step = CompiledStep::compile(definition).map_err(|reason| Error::PatternCompile {
                driver_id: driver_id.to_string(),
                step_id,
                reason,
            })?;
            compiled.push(Arc::new(step));
        }

        let count = compiled.len();
        {
            let mut table = self.table.write();
            let mut drivers = table.drivers.clone();
            drivers.insert(driver_id.to_string(), compiled);
            *table = Arc::new(MatcherTable { drivers });
        }

        info!(driver_id, steps = count, "Registered step definitions");
        Ok(count)
    }

    /// Remove every definition of a driver
    pub fn unload(&self, driver_id: &str) -> bool {
        let mut table = self.table.write();
        if !table.drivers.contains_key(driver_id) {
            return false;
        }
        let mut drivers = table.drivers.clone();
        drivers.remove(driver_id);
        *table = Arc::new(MatcherTable { drivers });
        true
    }

    /// Resolve step text to exactly one definition
    pub fn resolve(&self, step_text: &str) -> Result<StepMatch> {
        let table = self.table.read().clone();
        let text = step_text.trim();

        let mut candidates: Vec<(&CompiledStep, Map<String, Value>)> = table
            .drivers
            .values()
            .flatten()
            .filter_map(|step| step.matches(text).map(|params| (&**step, params)))
            .collect();

        // Most literal characters first, then fewest placeholders
        candidates.sort_by(|(a, _), (b, _)| {
            b.literal_chars
                .cmp(&a.literal_chars)
                .then(a.slots.len().cmp(&b.slots.len()))
        });

        let Some((best, _)) = candidates.first() else {
            debug!(step = text, "No step definition matched");
            return Err(Error::StepNotFound {
                step_text: text.to_string(),
            });
        };
        let rank = (best.literal_chars, best.slots.len());

        let tied: Vec<String> = candidates
            .iter()
            .filter(|(c, _)| (c.literal_chars, c.slots.len()) == rank)
            .map(|(c, _)| c.definition.qualified_id())
            .collect();
        if tied.len() > 1 {
            debug!(step = text, candidates = ?tied, "Ambiguous step");
            return Err(Error::AmbiguousStep {
                step_text: text.to_string(),
                candidates: tied,
            });
        }

        let (best, params) = candidates.swap_remove(0);
        debug!(
            step = text,
            driver_id = %best.definition.driver_id,
            step_id = %best.definition.id,
            "Step resolved"
        );
        Ok(StepMatch {
            definition: best.definition.clone(),
            params,
        })
    }

    /// Definitions registered for a driver, in registration order
    pub fn definitions(&self, driver_id: &str) -> Vec<StepDefinition> {
        self.table
            .read()
            .drivers
            .get(driver_id)
            .map(|steps| steps.iter().map(|s| (*s.definition).clone()).collect())
            .unwrap_or_default()
    }

    /// Drivers with registered definitions
    pub fn drivers(&self) -> Vec<String> {
        self.table.read().drivers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().drivers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
