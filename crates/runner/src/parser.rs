//! Feature file parser
//!
//! Turns Gherkin-style feature text into a [`FeatureDocument`]. Scenario
//! outlines are expanded here, one concrete scenario per Examples row, so
//! nothing downstream ever sees an outline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use stepwise_common::{
    Background, ExampleRow, FeatureDocument, ParseError, Result, Scenario, SourcePosition, Step,
    StepArgument, StepKeyword,
};
use tracing::{debug, warn};

type ParseResult<T> = std::result::Result<T, ParseError>;

/// Parse feature text into a document
pub fn parse(text: &str) -> ParseResult<FeatureDocument> {
    let result = Parser::default().run(text);
    if let Err(e) = &result {
        warn!(line = e.line, column = e.column, "Feature parse failed: {}", e.message);
    }
    result
}

/// Parse a feature file
pub fn parse_file(path: &Path) -> Result<FeatureDocument> {
    let content = std::fs::read_to_string(path)?;
    let mut document = parse(&content)?;
    document.source = Some(path.to_path_buf());
    debug!(
        "Parsed {} ({} scenario(s))",
        path.display(),
        document.scenarios.len()
    );
    Ok(document)
}

/// Load every `.feature` file under a path (a single file is also accepted)
pub fn load_all(path: &Path) -> Result<Vec<FeatureDocument>> {
    if path.is_file() {
        return Ok(vec![parse_file(path)?]);
    }

    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_file()
                && e.path()
                    .extension()
                    .map(|ext| ext == "feature")
                    .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect();
    files.sort();

    files.iter().map(|f| parse_file(f)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Start,
    Feature,
    Background,
    Scenario,
    Examples,
}

#[derive(Debug)]
struct ScenarioDraft {
    name: String,
    description: Vec<String>,
    tags: Vec<String>,
    steps: Vec<Step>,
    outline: bool,
    examples: Vec<ExamplesDraft>,
    position: SourcePosition,
}

#[derive(Debug)]
struct ExamplesDraft {
    tags: Vec<String>,
    position: SourcePosition,
    header: Option<(Vec<String>, SourcePosition)>,
    rows: Vec<Vec<String>>,
}

#[derive(Debug, Default)]
struct Parser {
    title: Option<String>,
    description: Vec<String>,
    feature_tags: Vec<String>,
    background: Option<Background>,
    drafts: Vec<ScenarioDraft>,
    pending_tags: Vec<(String, SourcePosition)>,
    section: Option<Section>,
}

impl Parser {
    fn section(&self) -> Section {
        self.section.unwrap_or(Section::Start)
    }

    fn run(mut self, text: &str) -> ParseResult<FeatureDocument> {
        let lines: Vec<&str> = text.lines().collect();
        let mut i = 0;

        while i < lines.len() {
            let raw = lines[i];
            let trimmed = raw.trim();
            let position = SourcePosition::new(i + 1, indent_of(raw) + 1);

            if trimmed.is_empty() || trimmed.starts_with('#') {
                i += 1;
                continue;
            }

            if trimmed.starts_with('@') {
                self.push_tags(trimmed, position)?;
            } else if let Some(rest) = strip_header(trimmed, &["Feature:"]) {
                self.start_feature(rest, position)?;
            } else if let Some(rest) = strip_header(trimmed, &["Background:"]) {
                self.start_background(rest, position)?;
            } else if let Some(rest) =
                strip_header(trimmed, &["Scenario Outline:", "Scenario Template:"])
            {
                self.start_scenario(rest, position, true)?;
            } else if let Some(rest) = strip_header(trimmed, &["Scenario:", "Example:"]) {
                self.start_scenario(rest, position, false)?;
            } else if strip_header(trimmed, &["Examples:", "Scenarios:"]).is_some() {
                self.start_examples(position)?;
            } else if trimmed.starts_with('|') {
                self.push_table_row(trimmed, position)?;
            } else if let Some(fence) = doc_string_fence(trimmed) {
                i = self.push_doc_string(&lines, i, fence, position)?;
            } else if let Some((keyword, step_text)) = split_step(trimmed) {
                self.push_step(keyword, step_text, position)?;
            } else {
                self.push_text(trimmed, position)?;
            }

            i += 1;
        }

        self.finish(lines.len())
    }

    fn require_feature(&self, position: SourcePosition) -> ParseResult<()> {
        if self.title.is_none() {
            return Err(ParseError::new(
                position.line,
                position.column,
                "expected a 'Feature:' header first",
            ));
        }
        Ok(())
    }

    fn take_tags(&mut self) -> Vec<String> {
        self.pending_tags.drain(..).map(|(t, _)| t).collect()
    }

    fn push_tags(&mut self, line: &str, position: SourcePosition) -> ParseResult<()> {
        for token in line.split_whitespace() {
            if token.starts_with('#') {
                break;
            }
            let tag = token.strip_prefix('@').filter(|t| !t.is_empty()).ok_or_else(|| {
                ParseError::new(
                    position.line,
                    position.column,
                    format!("invalid tag '{}'", token),
                )
            })?;
            self.pending_tags.push((tag.to_string(), position));
        }
        Ok(())
    }

    fn start_feature(&mut self, title: &str, position: SourcePosition) -> ParseResult<()> {
        if self.title.is_some() {
            return Err(ParseError::new(
                position.line,
                position.column,
                "only one Feature is allowed per document",
            ));
        }
        self.title = Some(title.to_string());
        self.feature_tags = self.take_tags();
        self.section = Some(Section::Feature);
        Ok(())
    }

    fn start_background(&mut self, name: &str, position: SourcePosition) -> ParseResult<()> {
        self.require_feature(position)?;
        if let Some((_, tag_pos)) = self.pending_tags.first() {
            return Err(ParseError::new(
                tag_pos.line,
                tag_pos.column,
                "tags cannot be applied to a Background",
            ));
        }
        if self.background.is_some() {
            return Err(ParseError::new(
                position.line,
                position.column,
                "only one Background is allowed per feature",
            ));
        }
        if !self.drafts.is_empty() {
            return Err(ParseError::new(
                position.line,
                position.column,
                "Background must come before the first Scenario",
            ));
        }
        self.background = Some(Background {
            name: name.to_string(),
            steps: Vec::new(),
            position,
        });
        self.section = Some(Section::Background);
        Ok(())
    }

    fn start_scenario(&mut self, name: &str, position: SourcePosition, outline: bool) -> ParseResult<()> {
        self.require_feature(position)?;
        if name.is_empty() {
            return Err(ParseError::new(
                position.line,
                position.column,
                "scenario has no name",
            ));
        }
        let tags = self.take_tags();
        self.drafts.push(ScenarioDraft {
            name: name.to_string(),
            description: Vec::new(),
            tags,
            steps: Vec::new(),
            outline,
            examples: Vec::new(),
            position,
        });
        self.section = Some(Section::Scenario);
        Ok(())
    }

    fn start_examples(&mut self, position: SourcePosition) -> ParseResult<()> {
        let tags = self.take_tags();
        let draft = match (self.section(), self.drafts.last_mut()) {
            (Section::Scenario | Section::Examples, Some(draft)) if draft.outline => draft,
            _ => {
                return Err(ParseError::new(
                    position.line,
                    position.column,
                    "Examples must belong to a Scenario Outline",
                ))
            }
        };
        draft.examples.push(ExamplesDraft {
            tags,
            position,
            header: None,
            rows: Vec::new(),
        });
        self.section = Some(Section::Examples);
        Ok(())
    }

    fn push_step(&mut self, keyword: StepKeyword, text: &str, position: SourcePosition) -> ParseResult<()> {
        let step = Step {
            keyword,
            text: text.to_string(),
            argument: None,
            position,
        };
        match self.section() {
            Section::Background => {
                if let Some(background) = self.background.as_mut() {
                    background.steps.push(step);
                }
                Ok(())
            }
            Section::Scenario => {
                if let Some(draft) = self.drafts.last_mut() {
                    draft.steps.push(step);
                }
                Ok(())
            }
            Section::Examples => Err(ParseError::new(
                position.line,
                position.column,
                "steps cannot follow an Examples table",
            )),
            Section::Start | Section::Feature => Err(ParseError::new(
                position.line,
                position.column,
                format!("step '{}' appears before any Scenario or Background", keyword),
            )),
        }
    }

    /// Last step of the current block, for attaching tables and doc strings
    fn current_step(&mut self) -> Option<&mut Step> {
        match self.section() {
            Section::Background => self.background.as_mut()?.steps.last_mut(),
            Section::Scenario => self.drafts.last_mut()?.steps.last_mut(),
            _ => None,
        }
    }

    fn push_table_row(&mut self, line: &str, position: SourcePosition) -> ParseResult<()> {
        let cells = split_cells(line).ok_or_else(|| {
            ParseError::new(
                position.line,
                position.column,
                "unterminated data table row (missing closing '|')",
            )
        })?;

        if self.section() == Section::Examples {
            let examples = self
                .drafts
                .last_mut()
                .and_then(|d| d.examples.last_mut())
                .ok_or_else(|| ParseError::new(position.line, position.column, "table without Examples"))?;
            let Some(width) = examples.header.as_ref().map(|(h, _)| h.len()) else {
                examples.header = Some((cells, position));
                return Ok(());
            };
            if width != cells.len() {
                return Err(ParseError::new(
                    position.line,
                    position.column,
                    format!(
                        "Examples row has {} cell(s), header has {}",
                        cells.len(),
                        width
                    ),
                ));
            }
            examples.rows.push(cells);
            return Ok(());
        }

        let step = self.current_step().ok_or_else(|| {
            ParseError::new(position.line, position.column, "data table must follow a step")
        })?;
        if step.argument.is_none() {
            step.argument = Some(StepArgument::DataTable { rows: vec![cells] });
            return Ok(());
        }
        match &mut step.argument {
            None => Ok(()),
            Some(StepArgument::DataTable { rows }) => {
                if rows[0].len() != cells.len() {
                    return Err(ParseError::new(
                        position.line,
                        position.column,
                        format!(
                            "data table row has {} cell(s), expected {}",
                            cells.len(),
                            rows[0].len()
                        ),
                    ));
                }
                rows.push(cells);
                Ok(())
            }
            Some(StepArgument::DocString { .. }) => Err(ParseError::new(
                position.line,
                position.column,
                "a step cannot have both a doc string and a data table",
            )),
        }
    }

    /// Consume a doc string starting at `start`; returns the closing line index
    fn push_doc_string(
        &mut self,
        lines: &[&str],
        start: usize,
        fence: &'static str,
        position: SourcePosition,
    ) -> ParseResult<usize> {
        let media_type = lines[start].trim()[fence.len()..].trim();
        let media_type = (!media_type.is_empty()).then(|| media_type.to_string());
        let indent = position.column - 1;

        let mut content = Vec::new();
        let mut end = None;
        for (offset, raw) in lines[start + 1..].iter().enumerate() {
            if raw.trim() == fence {
                end = Some(start + 1 + offset);
                break;
            }
            content.push(strip_indent(raw, indent));
        }

        let end = end.ok_or_else(|| {
            ParseError::new(position.line, position.column, "unterminated doc string")
        })?;

        let step = self.current_step().ok_or_else(|| {
            ParseError::new(position.line, position.column, "doc string must follow a step")
        })?;
        if step.argument.is_some() {
            return Err(ParseError::new(
                position.line,
                position.column,
                "step already has an argument",
            ));
        }
        step.argument = Some(StepArgument::DocString {
            content: content.join("\n"),
            media_type,
        });
        Ok(end)
    }

    fn push_text(&mut self, text: &str, position: SourcePosition) -> ParseResult<()> {
        match self.section() {
            Section::Feature => {
                self.description.push(text.to_string());
                Ok(())
            }
            Section::Scenario => match self.drafts.last_mut() {
                Some(draft) if draft.steps.is_empty() => {
                    draft.description.push(text.to_string());
                    Ok(())
                }
                _ => Err(ParseError::new(
                    position.line,
                    position.column,
                    format!("unexpected text '{}'", text),
                )),
            },
            Section::Start => Err(ParseError::new(
                position.line,
                position.column,
                "expected a 'Feature:' header first",
            )),
            _ => Err(ParseError::new(
                position.line,
                position.column,
                format!("unexpected text '{}'", text),
            )),
        }
    }

    fn finish(self, line_count: usize) -> ParseResult<FeatureDocument> {
        if let Some((_, position)) = self.pending_tags.first() {
            return Err(ParseError::new(
                position.line,
                position.column,
                "tags are not followed by a Feature, Scenario or Examples",
            ));
        }
        let title = self
            .title
            .ok_or_else(|| ParseError::new(line_count.max(1), 1, "missing 'Feature:' header"))?;

        let mut scenarios = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();

        for draft in self.drafts {
            for scenario in expand(draft, &self.feature_tags)? {
                if let Some(first) = seen.get(&scenario.name) {
                    return Err(ParseError::new(
                        scenario.position.line,
                        scenario.position.column,
                        format!(
                            "duplicate scenario name '{}' (first defined on line {})",
                            scenario.name, first
                        ),
                    ));
                }
                seen.insert(scenario.name.clone(), scenario.position.line);
                scenarios.push(scenario);
            }
        }

        Ok(FeatureDocument {
            title,
            description: self.description.join("\n"),
            tags: self.feature_tags,
            background: self.background,
            scenarios,
            source: None,
        })
    }
}

/// Turn a draft into concrete scenarios, expanding outlines
fn expand(draft: ScenarioDraft, feature_tags: &[String]) -> ParseResult<Vec<Scenario>> {
    let mut tags: Vec<String> = Vec::new();
    for tag in feature_tags.iter().chain(draft.tags.iter()) {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }

    if !draft.outline {
        return Ok(vec![Scenario {
            name: draft.name,
            description: draft.description.join("\n"),
            tags,
            steps: draft.steps,
            example: None,
            position: draft.position,
        }]);
    }

    if draft.examples.is_empty() {
        return Err(ParseError::new(
            draft.position.line,
            draft.position.column,
            format!("Scenario Outline '{}' has no Examples", draft.name),
        ));
    }

    let outline_text = outline_text(&draft);
    let mut scenarios = Vec::new();
    let mut index = 0;

    for examples in &draft.examples {
        let (header, header_pos) = examples.header.as_ref().ok_or_else(|| {
            ParseError::new(
                examples.position.line,
                examples.position.column,
                "Examples table has no header row",
            )
        })?;

        for column in header {
            if !outline_text.contains(&format!("<{}>", column)) {
                return Err(ParseError::new(
                    header_pos.line,
                    header_pos.column,
                    format!(
                        "Examples column '{}' is not used by Scenario Outline '{}'",
                        column, draft.name
                    ),
                ));
            }
        }

        let mut row_tags = tags.clone();
        for tag in &examples.tags {
            if !row_tags.contains(tag) {
                row_tags.push(tag.clone());
            }
        }

        for row in &examples.rows {
            index += 1;
            let values: Vec<(String, String)> = header.iter().cloned().zip(row.iter().cloned()).collect();
            let steps = draft
                .steps
                .iter()
                .map(|step| Step {
                    keyword: step.keyword,
                    text: substitute(&step.text, &values),
                    argument: step.argument.as_ref().map(|arg| match arg {
                        StepArgument::DataTable { rows } => StepArgument::DataTable {
                            rows: rows
                                .iter()
                                .map(|r| r.iter().map(|c| substitute(c, &values)).collect())
                                .collect(),
                        },
                        StepArgument::DocString { content, media_type } => StepArgument::DocString {
                            content: substitute(content, &values),
                            media_type: media_type.clone(),
                        },
                    }),
                    position: step.position,
                })
                .collect();

            scenarios.push(Scenario {
                name: format!("{} #{}", substitute(&draft.name, &values), index),
                description: draft.description.join("\n"),
                tags: row_tags.clone(),
                steps,
                example: Some(ExampleRow { index, values }),
                position: draft.position,
            });
        }
    }

    Ok(scenarios)
}

/// All text of an outline in which placeholders may appear
fn outline_text(draft: &ScenarioDraft) -> String {
    let mut text = draft.name.clone();
    for step in &draft.steps {
        text.push('\n');
        text.push_str(&step.text);
        match &step.argument {
            Some(StepArgument::DataTable { rows }) => {
                for row in rows {
                    text.push('\n');
                    text.push_str(&row.join("|"));
                }
            }
            Some(StepArgument::DocString { content, .. }) => {
                text.push('\n');
                text.push_str(content);
            }
            None => {}
        }
    }
    text
}

/// Replace `<name>` placeholders in a single left-to-right pass
fn substitute(text: &str, values: &[(String, String)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('>') {
            Some(close) => {
                let name = &after[..close];
                match values.iter().find(|(k, _)| k == name) {
                    Some((_, value)) => out.push_str(value),
                    None => {
                        out.push('<');
                        out.push_str(name);
                        out.push('>');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn indent_of(raw: &str) -> usize {
    raw.chars().take_while(|c| c.is_whitespace()).count()
}

fn strip_indent(raw: &str, indent: usize) -> String {
    let leading = indent_of(raw).min(indent);
    raw.chars().skip(leading).collect()
}

fn strip_header<'a>(line: &'a str, headers: &[&str]) -> Option<&'a str> {
    headers
        .iter()
        .find_map(|h| line.strip_prefix(h))
        .map(str::trim)
}

fn doc_string_fence(line: &str) -> Option<&'static str> {
    if line.starts_with("\"\"\"") {
        Some("\"\"\"")
    } else if line.starts_with("```") {
        Some("```")
    } else {
        None
    }
}

fn split_step(line: &str) -> Option<(StepKeyword, &str)> {
    StepKeyword::ALL.iter().find_map(|keyword| {
        let rest = line.strip_prefix(keyword.as_str())?;
        if rest.starts_with(char::is_whitespace) && !rest.trim().is_empty() {
            Some((*keyword, rest.trim()))
        } else {
            None
        }
    })
}

/// Split a `| a | b |` row into cells, honoring `\|`, `\\` and `\n` escapes.
/// Returns `None` when the row is not closed by an unescaped `|`.
fn split_cells(line: &str) -> Option<Vec<String>> {
    let body = line.strip_prefix('|')?;
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut chars = body.chars();
    let mut closed = false;

    while let Some(c) = chars.next() {
        closed = false;
        match c {
            '\\' => match chars.next() {
                Some('|') => current.push('|'),
                Some('\\') => current.push('\\'),
                Some('n') => current.push('\n'),
                Some(other) => {
                    current.push('\\');
                    current.push(other);
                }
                None => current.push('\\'),
            },
            '|' => {
                cells.push(current.trim().to_string());
                current.clear();
                closed = true;
            }
            _ => current.push(c),
        }
    }

    (closed && current.trim().is_empty()).then_some(cells)
}
