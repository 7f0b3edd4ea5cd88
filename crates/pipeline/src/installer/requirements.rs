//! pip requirements file parsing
//!
//! Only enough of the format is understood to reject malformed manifests up
//! front and to tell an empty manifest from one that needs the installer.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("line {line}: {reason}")]
pub struct RequirementsError {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub extras: Vec<String>,
    /// Version specifier such as `>=2.0,<3`
    pub specifier: Option<String>,
    /// Environment marker after `;`
    pub marker: Option<String>,
    /// Direct reference after `@`
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequirementLine {
    Package(Requirement),
    Editable(String),
    /// Archive, VCS URL or local path
    Url(String),
    /// `-r other.txt` or `-c constraints.txt`
    Include { path: String, constraint: bool },
    /// Global installer option such as `--index-url`
    Option(String),
}

impl RequirementLine {
    /// Whether the line makes the installer fetch something
    pub fn installs_something(&self) -> bool {
        !matches!(self, RequirementLine::Option(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    pub lines: Vec<RequirementLine>,
}

const OPTIONS_WITH_VALUE: &[&str] = &[
    "-i",
    "--index-url",
    "--extra-index-url",
    "-f",
    "--find-links",
    "--trusted-host",
    "--no-binary",
    "--only-binary",
    "--use-feature",
];

const FLAG_OPTIONS: &[&str] = &["--pre", "--no-index", "--prefer-binary", "--require-hashes"];

fn requirement_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(?:\[([^\]]*)\])?\s*(.*)$")
            .expect("valid regex")
    })
}

fn specifier_clause_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(===|==|!=|~=|<=|>=|<|>)\s*[A-Za-z0-9.*+!_-]+$").expect("valid regex")
    })
}

/// Join `\` continuations and drop comments, keeping the first line number
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (index, raw) in content.lines().enumerate() {
        let line_no = index + 1;
        let mut text = strip_comment(raw).to_string();
        let continued = text.trim_end().ends_with('\\');
        if continued {
            let trimmed = text.trim_end();
            text = trimmed[..trimmed.len() - 1].to_string();
        }

        let (start, mut joined) = pending.take().unwrap_or((line_no, String::new()));
        if !joined.is_empty() {
            joined.push(' ');
        }
        joined.push_str(text.trim());

        if continued {
            pending = Some((start, joined));
        } else if !joined.trim().is_empty() {
            lines.push((start, joined.trim().to_string()));
        }
    }

    if let Some((start, joined)) = pending {
        if !joined.trim().is_empty() {
            lines.push((start, joined.trim().to_string()));
        }
    }

    lines
}

fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    match line.find(" #").or_else(|| line.find("\t#")) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn is_url_or_path(token: &str) -> bool {
    token.contains("://")
        || token.starts_with("./")
        || token.starts_with("../")
        || token.starts_with('/')
        || token.ends_with(".whl")
        || token.ends_with(".tar.gz")
        || token.ends_with(".zip")
}

/// Remove per-requirement options such as `--hash=sha256:...`
fn strip_per_requirement_options(line: &str) -> String {
    let mut kept = Vec::new();
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "--hash" || token == "--config-settings" || token == "--global-option" {
            tokens.next();
        } else if token.starts_with("--hash=")
            || token.starts_with("--config-settings=")
            || token.starts_with("--global-option=")
        {
            continue;
        } else {
            kept.push(token);
        }
    }
    kept.join(" ")
}

fn split_option(line: &str) -> (&str, Option<&str>) {
    if let Some((flag, value)) = line.split_once('=') {
        if flag.starts_with("--") && !flag.contains(char::is_whitespace) {
            return (flag, Some(value.trim()));
        }
    }
    match line.split_once(char::is_whitespace) {
        Some((flag, value)) => (flag, Some(value.trim())),
        None => (line, None),
    }
}

fn parse_option(line_no: usize, line: &str) -> Result<RequirementLine, RequirementsError> {
    let (flag, value) = split_option(line);
    let error = |reason: String| RequirementsError {
        line: line_no,
        reason,
    };
    let value = value.filter(|v| !v.is_empty());

    match flag {
        "-r" | "--requirement" | "-c" | "--constraint" => {
            let path = value.ok_or_else(|| error(format!("{} needs a file", flag)))?;
            Ok(RequirementLine::Include {
                path: path.to_string(),
                constraint: flag == "-c" || flag == "--constraint",
            })
        }
        "-e" | "--editable" => {
            let target = value.ok_or_else(|| error(format!("{} needs a path or URL", flag)))?;
            Ok(RequirementLine::Editable(target.to_string()))
        }
        _ if OPTIONS_WITH_VALUE.contains(&flag) => {
            if value.is_none() {
                return Err(error(format!("{} needs a value", flag)));
            }
            Ok(RequirementLine::Option(line.to_string()))
        }
        _ if FLAG_OPTIONS.contains(&flag) => Ok(RequirementLine::Option(line.to_string())),
        _ => Err(error(format!("unsupported option {}", flag))),
    }
}

fn parse_requirement(line_no: usize, line: &str) -> Result<RequirementLine, RequirementsError> {
    let error = |reason: String| RequirementsError {
        line: line_no,
        reason,
    };

    let (body, marker) = match line.split_once(';') {
        Some((body, marker)) => (body.trim(), Some(marker.trim().to_string())),
        None => (line.trim(), None),
    };

    if is_url_or_path(body) && !body.contains(" @ ") {
        return Ok(RequirementLine::Url(body.to_string()));
    }

    let captures = requirement_regex()
        .captures(body)
        .ok_or_else(|| error(format!("invalid requirement '{}'", line)))?;

    let name = captures[1].to_string();
    let extras = captures
        .get(2)
        .map(|m| {
            m.as_str()
                .split(',')
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let rest = captures.get(3).map(|m| m.as_str().trim()).unwrap_or("");

    let mut requirement = Requirement {
        name,
        extras,
        specifier: None,
        marker: marker.filter(|m| !m.is_empty()),
        url: None,
    };

    if let Some(url) = rest.strip_prefix('@') {
        let url = url.trim();
        if url.is_empty() {
            return Err(error(format!("missing URL after '@' in '{}'", line)));
        }
        requirement.url = Some(url.to_string());
    } else if !rest.is_empty() {
        let spec = rest
            .trim_start_matches('(')
            .trim_end_matches(')')
            .trim();
        for clause in spec.split(',') {
            if !specifier_clause_regex().is_match(clause.trim()) {
                return Err(error(format!("invalid version specifier '{}'", rest)));
            }
        }
        requirement.specifier = Some(spec.to_string());
    }

    Ok(RequirementLine::Package(requirement))
}

impl Requirements {
    pub fn parse(content: &str) -> Result<Self, RequirementsError> {
        let mut lines = Vec::new();

        for (line_no, line) in logical_lines(content) {
            let line = strip_per_requirement_options(&line);
            if line.is_empty() {
                continue;
            }
            let parsed = if line.starts_with('-') {
                parse_option(line_no, &line)?
            } else {
                parse_requirement(line_no, &line)?
            };
            lines.push(parsed);
        }

        Ok(Self { lines })
    }

    /// No line would make the installer fetch anything
    pub fn is_empty(&self) -> bool {
        !self.lines.iter().any(RequirementLine::installs_something)
    }

    pub fn packages(&self) -> impl Iterator<Item = &Requirement> {
        self.lines.iter().filter_map(|line| match line {
            RequirementLine::Package(requirement) => Some(requirement),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| line.installs_something())
            .count()
    }
}
