// Definition error types
// Location, source excerpt and fix suggestions for malformed workflow files

use std::fmt;

/// A malformed job definition, reported before anything executes
#[derive(Debug, Clone)]
pub struct ParseError {
    /// Error message
    pub message: String,
    /// Line number (1-indexed, 0 when the error has no source location)
    pub line: usize,
    /// Column number (1-indexed)
    pub column: usize,
    /// Dotted path of the offending element, e.g. `jobs.test.steps[2]`
    pub path: Option<String>,
    /// Surrounding source lines
    pub context: String,
    /// Optional suggestion for fixing the error
    pub suggestion: Option<String>,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// YAML syntax error
    YamlSyntax,
    /// Wrong types or missing fields
    InvalidSchema,
    /// Well-formed YAML describing an invalid workflow
    Validation,
    /// File could not be read
    Io,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
            path: None,
            context: String::new(),
            suggestion: None,
            kind: ParseErrorKind::InvalidSchema,
        }
    }

    /// Semantic error attached to a path in the document rather than a line
    pub fn validation(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            kind: ParseErrorKind::Validation,
            ..Self::new(message, 0, 0)
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(message, 0, 0).with_kind(ParseErrorKind::Io)
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_kind(mut self, kind: ParseErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Attach the lines around the error location
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        if self.line == 0 {
            return self;
        }

        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let prefix = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", prefix, line_num, line));

            if line_num == self.line && self.column > 0 {
                let indicator = " ".repeat(self.column - 1) + "^";
                context.push_str(&format!("       | {}\n", indicator));
            }
        }

        self.context = context;
        self
    }

    /// Build from a serde_yaml error, keeping its location
    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((0, 0));

        let kind = if err.to_string().contains("invalid type")
            || err.to_string().contains("missing field")
        {
            ParseErrorKind::InvalidSchema
        } else {
            ParseErrorKind::YamlSyntax
        };

        let mut parsed = ParseError::new(format_yaml_error_message(err), line, column)
            .with_kind(kind)
            .with_source_context(source, 2);
        parsed.suggestion = suggest_yaml_fix(err, source, line);
        parsed
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if self.line > 0 {
            write!(f, " (line {}:{})", self.line, self.column)?;
        } else if let Some(path) = &self.path {
            write!(f, " (at {})", path)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            write!(f, "{}", self.context.trim_end())?;
        }

        if let Some(suggestion) = &self.suggestion {
            writeln!(f)?;
            write!(f, "help: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ParseError {}

fn format_yaml_error_message(err: &serde_yaml::Error) -> String {
    let msg = err.to_string();
    // Location is rendered separately
    let msg = match msg.find(" at line ") {
        Some(pos) => msg[..pos].to_string(),
        None => msg,
    };

    if msg.contains("missing field") {
        if let Some(field) = extract_between(&msg, "missing field `", "`") {
            return format!("missing required field '{}'", field);
        }
    }

    if msg.contains("invalid type") {
        if let (Some(found), Some(expected)) = (
            extract_between(&msg, "invalid type: ", ", expected"),
            msg.split(", expected ").nth(1),
        ) {
            return format!("expected {}, but found {}", expected, found);
        }
    }

    msg
}

fn extract_between(msg: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(msg[start..end].to_string())
}

fn suggest_yaml_fix(err: &serde_yaml::Error, source: &str, line: usize) -> Option<String> {
    let msg = err.to_string();
    let error_line = source
        .lines()
        .nth(line.saturating_sub(1))
        .unwrap_or_default();

    if msg.contains("missing field `jobs`") {
        return Some("a workflow needs a 'jobs:' mapping with at least one job".to_string());
    }

    if msg.contains("missing field `on`") {
        return Some(
            "declare a trigger, e.g. 'on: workflow_dispatch' or 'on: push'".to_string(),
        );
    }

    if error_line.starts_with('\t') {
        return Some(
            "YAML prefers spaces over tabs for indentation. Replace tabs with spaces.".to_string(),
        );
    }

    let typo_suggestions = [
        ("continue_on_error", "continue-on-error"),
        ("working_directory", "working-directory"),
        ("timeout_minutes", "timeout-minutes"),
        ("max_parallel", "max-parallel"),
        ("fail_fast", "fail-fast"),
    ];

    for (typo, correct) in typo_suggestions {
        if error_line.contains(typo) {
            return Some(format!("did you mean '{}'?", correct));
        }
    }

    None
}
