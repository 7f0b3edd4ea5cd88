//! Dockerfile rendering and parsing
//!
//! Only the instruction subset that maps onto the build pipeline is
//! understood: a single `FROM`, `WORKDIR`, context `COPY`, a pip install
//! `RUN`, `ENV`, `EXPOSE` and exec-form `CMD`/`ENTRYPOINT`.

use super::{
    BuildDescriptor, DependencySpec, DescriptorError, DescriptorMetadata, ExposedPort, ImageRef,
    Protocol, RuntimeSpec, StageSpec, StagingStrategy,
};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

const NO_CACHE_FLAG: &str = "--no-cache-dir";

/// Render a descriptor as a Dockerfile whose instructions follow the
/// pipeline's step order
pub fn render(descriptor: &BuildDescriptor) -> String {
    let mut lines = Vec::new();
    let manifest = &descriptor.dependencies.manifest;

    lines.push(format!("FROM {}", descriptor.base));
    lines.push(String::new());
    lines.push(format!("WORKDIR {}", descriptor.stage.workdir));

    let mut install = format!("RUN pip install {} -r {}", NO_CACHE_FLAG, manifest);
    for arg in &descriptor.dependencies.install_args {
        install.push(' ');
        install.push_str(&quote_word(arg));
    }

    match descriptor.stage.strategy {
        StagingStrategy::SingleCopy => {
            lines.push("COPY . .".to_string());
            lines.push(install);
        }
        StagingStrategy::ManifestFirst => {
            lines.push(format!("COPY {} {}", manifest, manifest));
            lines.push(install);
            lines.push("COPY . .".to_string());
        }
    }
    lines.push(String::new());

    for (key, value) in &descriptor.runtime.env {
        lines.push(format!("ENV {}={}", key, quote_word(value)));
    }

    for port in &descriptor.runtime.ports {
        match port.protocol {
            Protocol::Tcp => lines.push(format!("EXPOSE {}", port.port)),
            Protocol::Udp => lines.push(format!("EXPOSE {}", port)),
        }
    }

    let argv = serde_json::to_string(&descriptor.runtime.entrypoint)
        .unwrap_or_else(|_| "[]".to_string())
        .replace("\",\"", "\", \"");
    lines.push(format!("CMD {}", argv));

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn quote_word(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        word.to_string()
    } else {
        format!("\"{}\"", word.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

fn pip_install_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:python[0-9.]*\s+-m\s+)?pip[0-9.]*\s+install\s+(.*)$").expect("valid regex")
    })
}

#[derive(Default)]
struct ParseState {
    base: Option<ImageRef>,
    workdir: Option<String>,
    manifest_copy: Option<String>,
    full_copy_before_install: bool,
    full_copy_after_install: bool,
    manifest: Option<String>,
    install_args: Vec<String>,
    env: BTreeMap<String, String>,
    ports: Vec<ExposedPort>,
    entrypoint: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
}

/// Parse a Dockerfile into a descriptor
pub fn parse(content: &str) -> Result<BuildDescriptor, DescriptorError> {
    let mut state = ParseState::default();

    for (line_no, instruction) in logical_lines(content) {
        let err = |reason: String| DescriptorError::Dockerfile {
            line: line_no,
            reason,
        };

        let (keyword, args) = match instruction.split_once(char::is_whitespace) {
            Some((k, a)) => (k.to_ascii_uppercase(), a.trim()),
            None => (instruction.to_ascii_uppercase(), ""),
        };

        if keyword != "FROM" && state.base.is_none() {
            return Err(err(format!("{} appears before FROM", keyword)));
        }

        match keyword.as_str() {
            "FROM" => {
                if state.base.is_some() {
                    return Err(err("multi-stage builds are not supported".to_string()));
                }
                let words = split_words(args).map_err(&err)?;
                match words.as_slice() {
                    [reference] => state.base = Some(ImageRef::parse(reference)?),
                    [reference, alias, _] if alias.eq_ignore_ascii_case("as") => {
                        state.base = Some(ImageRef::parse(reference)?)
                    }
                    _ => return Err(err("FROM expects a single image reference".to_string())),
                }
            }
            "WORKDIR" => {
                if !args.starts_with('/') {
                    return Err(err(format!("WORKDIR must be absolute: {}", args)));
                }
                let trimmed = args.trim_end_matches('/');
                state.workdir = Some(if trimmed.is_empty() {
                    "/".to_string()
                } else {
                    trimmed.to_string()
                });
            }
            "COPY" | "ADD" => {
                let words = split_words(args).map_err(&err)?;
                if words.iter().any(|w| w.starts_with("--")) {
                    return Err(err(format!("{} flags are not supported", keyword)));
                }
                let [source, _dest] = words.as_slice() else {
                    return Err(err(format!("{} expects exactly one source", keyword)));
                };
                let source = source.trim_start_matches("./");
                if source.is_empty() || source == "." {
                    if state.manifest.is_some() {
                        state.full_copy_after_install = true;
                    } else {
                        state.full_copy_before_install = true;
                    }
                } else if state.manifest.is_none() && !state.full_copy_before_install {
                    state.manifest_copy = Some(source.to_string());
                } else {
                    return Err(err(format!("unexpected partial copy of {}", source)));
                }
            }
            "RUN" => {
                if state.manifest.is_some() {
                    return Err(err("only one dependency installation is supported".to_string()));
                }
                let caps = pip_install_regex().captures(args).ok_or_else(|| {
                    err("only pip install RUN instructions are supported".to_string())
                })?;
                let words = split_words(&caps[1]).map_err(&err)?;
                let (manifest, install_args) = parse_install_args(words).map_err(&err)?;

                let staged = state.full_copy_before_install
                    || state.manifest_copy.as_deref() == Some(manifest.as_str());
                if !staged {
                    return Err(err(format!(
                        "{} is installed before it is copied into the image",
                        manifest
                    )));
                }
                state.manifest = Some(manifest);
                state.install_args = install_args;
            }
            "ENV" => {
                for (key, value) in parse_env(args).map_err(&err)? {
                    state.env.insert(key, value);
                }
            }
            "EXPOSE" => {
                for word in split_words(args).map_err(&err)? {
                    state.ports.push(word.parse()?);
                }
            }
            "CMD" => state.cmd = Some(parse_exec_form(&keyword, args).map_err(&err)?),
            "ENTRYPOINT" => state.entrypoint = Some(parse_exec_form(&keyword, args).map_err(&err)?),
            other => return Err(err(format!("unsupported instruction {}", other))),
        }
    }

    finish(state)
}

fn finish(state: ParseState) -> Result<BuildDescriptor, DescriptorError> {
    let missing =
        |what: &str| DescriptorError::ValidationFailed(format!("Dockerfile has no {}", what));

    let base = state.base.ok_or_else(|| missing("FROM instruction"))?;
    let manifest = state
        .manifest
        .ok_or_else(|| missing("pip install instruction"))?;

    let strategy = if state.full_copy_before_install {
        StagingStrategy::SingleCopy
    } else if state.full_copy_after_install {
        StagingStrategy::ManifestFirst
    } else {
        return Err(missing("COPY of the build context"));
    };

    let mut entrypoint = state.entrypoint.unwrap_or_default();
    entrypoint.extend(state.cmd.unwrap_or_default());

    Ok(BuildDescriptor {
        version: super::default_version(),
        metadata: DescriptorMetadata::default(),
        base,
        stage: StageSpec {
            workdir: state.workdir.unwrap_or_else(|| "/".to_string()),
            strategy,
        },
        dependencies: DependencySpec {
            manifest,
            install_args: state.install_args,
        },
        runtime: RuntimeSpec {
            env: state.env,
            ports: state.ports,
            entrypoint,
        },
    })
}

/// Joins backslash continuations and drops comments, keeping the number of
/// the line each instruction starts on
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for (idx, raw) in content.lines().enumerate() {
        let trimmed = raw.trim();
        if current.is_empty() {
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            start = idx + 1;
        } else if trimmed.starts_with('#') {
            continue;
        }

        match trimmed.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head.trim_end());
                current.push(' ');
            }
            None => {
                current.push_str(trimmed);
                result.push((start, std::mem::take(&mut current).trim().to_string()));
            }
        }
    }

    if !current.trim().is_empty() {
        result.push((start, current.trim().to_string()));
    }

    result
}

/// Whitespace splitting with single/double quotes and backslash escapes
fn split_words(input: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn parse_install_args(words: Vec<String>) -> Result<(String, Vec<String>), String> {
    let mut manifest = None;
    let mut rest = Vec::new();
    let mut iter = words.into_iter();

    while let Some(word) = iter.next() {
        if word == "-r" || word == "--requirement" {
            let value = iter
                .next()
                .ok_or_else(|| format!("{} needs a file argument", word))?;
            manifest = Some(value);
        } else if let Some(value) = word.strip_prefix("--requirement=") {
            manifest = Some(value.to_string());
        } else if word != NO_CACHE_FLAG {
            rest.push(word);
        }
    }

    let manifest = manifest.ok_or_else(|| "pip install must read a requirements file".to_string())?;
    Ok((manifest.trim_start_matches("./").to_string(), rest))
}

fn parse_env(args: &str) -> Result<Vec<(String, String)>, String> {
    let words = split_words(args)?;
    if words.is_empty() {
        return Err("ENV needs at least one variable".to_string());
    }

    if !words[0].contains('=') {
        // Legacy `ENV key value with spaces`
        let (key, value) = args
            .split_once(char::is_whitespace)
            .ok_or_else(|| "ENV needs a value".to_string())?;
        let value = split_words(value)?.join(" ");
        return Ok(vec![(key.to_string(), value)]);
    }

    words
        .into_iter()
        .map(|word| {
            word.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| format!("expected key=value, got {}", word))
        })
        .collect()
}

fn parse_exec_form(keyword: &str, args: &str) -> Result<Vec<String>, String> {
    if !args.starts_with('[') {
        return Err(format!(
            "{} must use exec form (a JSON array); shell form is not supported",
            keyword
        ));
    }
    serde_json::from_str::<Vec<String>>(args)
        .map_err(|e| format!("{} is not a valid JSON string array: {}", keyword, e))
}
