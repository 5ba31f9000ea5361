//! Path templates and collision-free file naming

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use std::path::{Component, Path, PathBuf};

/// Length of the uniqueness token inserted into fixed file names
pub const TOKEN_LEN: usize = 8;

const TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S_%6f";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Index,
    Time,
}

/// A parsed log path template such as `logs/app.{n}.log`
///
/// Supported placeholders are `{n}` (1-based rotation counter) and `{time}`
/// (UTC timestamp of the moment the file is opened). Placeholders may only
/// appear in the file name; the directory part is resolved to an absolute,
/// normalized path once at parse time.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    raw: String,
    dir: PathBuf,
    segments: Vec<Segment>,
}

impl PathTemplate {
    /// Parse and resolve a template
    pub fn parse(template: &str) -> Result<Self> {
        if template.trim().is_empty() {
            return Err(Error::path("path template is empty"));
        }

        let path = Path::new(template);
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                Error::path(format!("path template '{}' does not name a file", template))
            })?;

        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        if parent.to_string_lossy().contains(['{', '}']) {
            return Err(Error::path(format!(
                "placeholders are only supported in the file name: '{}'",
                template
            )));
        }

        let segments = parse_segments(file_name).map_err(|message| {
            Error::path(format!("invalid path template '{}': {}", template, message))
        })?;

        Ok(Self {
            raw: template.to_string(),
            dir: absolutize(parent)?,
            segments,
        })
    }

    /// The template as given by the user
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Absolute directory every file of this template lives in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the template carries the `{n}` rotation counter
    pub fn has_index(&self) -> bool {
        self.segments.contains(&Segment::Index)
    }

    /// Whether the template names the same file on every call
    pub fn is_fixed(&self) -> bool {
        self.segments
            .iter()
            .all(|segment| matches!(segment, Segment::Literal(_)))
    }

    /// Render the concrete path for the given rotation index
    pub fn format(&self, index: u32, now: DateTime<Utc>) -> PathBuf {
        let mut name = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => name.push_str(text),
                Segment::Index => name.push_str(&index.to_string()),
                Segment::Time => name.push_str(&now.format(TIME_FORMAT).to_string()),
            }
        }
        self.dir.join(name)
    }

    /// Regex source matching every file name this template can produce,
    /// including uniqueness tokens and any post-processing suffixes
    pub fn file_name_pattern(&self) -> String {
        let token_slot = if self.has_index() {
            None
        } else {
            last_dot(&self.segments)
        };

        let mut pattern = String::from("^");
        for (position, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(text) => match token_slot {
                    Some((slot, offset)) if slot == position => {
                        pattern.push_str(&regex::escape(&text[..offset]));
                        pattern.push_str(&format!("(?:\\.[A-Z0-9]{{{}}})?", TOKEN_LEN));
                        pattern.push_str(&regex::escape(&text[offset..]));
                    }
                    _ => pattern.push_str(&regex::escape(text)),
                },
                Segment::Index => pattern.push_str(r"\d+"),
                Segment::Time => pattern.push_str(r"[0-9_\-]+"),
            }
        }
        if !self.has_index() && token_slot.is_none() {
            pattern.push_str(&format!("(?:\\.[A-Z0-9]{{{}}})?", TOKEN_LEN));
        }
        pattern.push_str(r"(?:\..+)?$");
        pattern
    }
}

/// Locate the dot a uniqueness token is inserted before: the last dot of the
/// rendered name, which always sits in a literal since placeholders render
/// without dots
fn last_dot(segments: &[Segment]) -> Option<(usize, usize)> {
    segments
        .iter()
        .enumerate()
        .rev()
        .find_map(|(position, segment)| match segment {
            Segment::Literal(text) => text
                .rfind('.')
                .filter(|&offset| position > 0 || offset > 0)
                .map(|offset| (position, offset)),
            _ => None,
        })
}

fn parse_segments(name: &str) -> std::result::Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = name.chars();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') => return Err("nested '{' in placeholder".to_string()),
                        Some(c) => key.push(c),
                        None => return Err("unclosed '{'".to_string()),
                    }
                }

                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(match key.trim() {
                    "n" => Segment::Index,
                    "time" => Segment::Time,
                    other => return Err(format!("unknown placeholder '{{{}}}'", other)),
                });
            }
            '}' => return Err("unmatched '}'".to_string()),
            c => literal.push(c),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(segments)
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(normalize(&absolute))
}

/// Lexically resolve `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Generate an uppercase alphanumeric uniqueness token
pub fn uniqueness_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(|byte| (byte as char).to_ascii_uppercase())
        .collect()
}

/// Insert `token` between the stem and the extension of `path`
pub fn with_token(path: &Path, token: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let renamed = match name.rfind('.').filter(|&offset| offset > 0) {
        Some(offset) => format!("{}.{}{}", &name[..offset], token, &name[offset..]),
        None => format!("{}.{}", name, token),
    };
    path.with_file_name(renamed)
}

/// A variant of `path` carrying a fresh uniqueness token that does not exist
/// on disk yet
pub fn unique_variant(path: &Path) -> PathBuf {
    loop {
        let candidate = with_token(path, &uniqueness_token());
        if !candidate.exists() {
            return candidate;
        }
    }
}

/// Name of the artifact derived from `source` with `suffix` appended
///
/// When `<source>.<suffix>` is taken, `<source>.1.<suffix>`,
/// `<source>.2.<suffix>`, ... are tried in turn; an existing file is never
/// returned.
pub fn collision_free(source: &Path, suffix: &str) -> PathBuf {
    let name = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let natural = source.with_file_name(format!("{}.{}", name, suffix));
    if !natural.exists() {
        return natural;
    }

    let mut counter: u64 = 1;
    loop {
        let candidate = source.with_file_name(format!("{}.{}.{}", name, counter, suffix));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use tempfile::TempDir;

    #[test]
    fn test_index_placeholder() {
        let temp_dir = TempDir::new().unwrap();
        let template = temp_dir.path().join("app.{n}.log");
        let template = PathTemplate::parse(template.to_str().unwrap()).unwrap();

        assert!(template.has_index());
        assert!(!template.is_fixed());
        assert_eq!(
            template.format(1, Utc::now()),
            temp_dir.path().join("app.1.log")
        );
        assert_eq!(
            template.format(12, Utc::now()),
            temp_dir.path().join("app.12.log")
        );
    }

    #[test]
    fn test_fixed_template() {
        let template = PathTemplate::parse("/var/log/fennec/test.log").unwrap();
        assert!(template.is_fixed());
        assert!(!template.has_index());
        assert_eq!(
            template.format(3, Utc::now()),
            PathBuf::from("/var/log/fennec/test.log")
        );
    }

    #[test]
    fn test_relative_template_is_absolute_and_normalized() {
        let template = PathTemplate::parse("./logs/../out/./app.log").unwrap();
        let expected = std::env::current_dir().unwrap().join("out");

        assert!(template.dir().is_absolute());
        assert_eq!(template.dir(), expected.as_path());
    }

    #[test]
    fn test_time_placeholder() {
        let template = PathTemplate::parse("/tmp/app_{time}.log").unwrap();
        let now = Utc::now();
        let path = template.format(1, now);
        let name = path.file_name().unwrap().to_str().unwrap();

        assert!(name.starts_with("app_"));
        assert!(name.ends_with(".log"));
        assert!(name.contains(&now.format("%Y-%m-%d").to_string()));
    }

    #[test]
    fn test_malformed_templates() {
        for template in [
            "",
            "/tmp/{x}.log",
            "/tmp/{n.log",
            "/tmp/n}.log",
            "/tmp/{{n}}.log",
            "/tmp/{n}/app.log",
        ] {
            let result = PathTemplate::parse(template);
            assert!(
                matches!(result, Err(Error::Path { .. })),
                "template {:?} should be rejected",
                template
            );
        }
    }

    #[test]
    fn test_with_token() {
        let path = Path::new("/tmp/test.log");
        assert_eq!(
            with_token(path, "ABCD1234"),
            PathBuf::from("/tmp/test.ABCD1234.log")
        );
        assert_eq!(
            with_token(Path::new("/tmp/app"), "ABCD1234"),
            PathBuf::from("/tmp/app.ABCD1234")
        );
        assert_eq!(
            with_token(Path::new("/tmp/.hidden"), "ABCD1234"),
            PathBuf::from("/tmp/.hidden.ABCD1234")
        );
    }

    #[test]
    fn test_uniqueness_token_shape() {
        let token = uniqueness_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_collision_free_suffixing() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("1.log");

        assert_eq!(
            collision_free(&source, "gz"),
            temp_dir.path().join("1.log.gz")
        );

        std::fs::write(temp_dir.path().join("1.log.gz"), "").unwrap();
        assert_eq!(
            collision_free(&source, "gz"),
            temp_dir.path().join("1.log.1.gz")
        );

        std::fs::write(temp_dir.path().join("1.log.1.gz"), "").unwrap();
        assert_eq!(
            collision_free(&source, "gz"),
            temp_dir.path().join("1.log.2.gz")
        );
    }

    #[test]
    fn test_file_name_pattern() {
        let fixed = PathTemplate::parse("/tmp/test.log").unwrap();
        let fixed = Regex::new(&fixed.file_name_pattern()).unwrap();
        assert!(fixed.is_match("test.log"));
        assert!(fixed.is_match("test.ABCD1234.log"));
        assert!(fixed.is_match("test.ABCD1234.log.gz"));
        assert!(fixed.is_match("test.log.1.tar.gz"));
        assert!(!fixed.is_match("other.log"));
        assert!(!fixed.is_match("testXlog"));

        let indexed = PathTemplate::parse("/tmp/app.{n}.log").unwrap();
        let indexed = Regex::new(&indexed.file_name_pattern()).unwrap();
        assert!(indexed.is_match("app.1.log"));
        assert!(indexed.is_match("app.42.log.xz"));
        assert!(!indexed.is_match("app.x.log"));
    }
}
