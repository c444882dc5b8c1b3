//! Command-line resolution for task executables.
//!
//! A command string is split once at startup with shell-like quoting rules.
//! At launch each word has `$VAR` / `${VAR}` expanded from the environment
//! (unset variables stay literal) and wildcard words (`*`, `?`) matched against
//! the working directory (no match leaves the word literal). Finally the first
//! word is looked up in the [`ExecutableRegistry`].

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Quoting context of a word segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

/// One shell word, kept as quoted segments until expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Word {
    segments: Vec<(String, Quote)>,
}

impl Word {
    fn push(&mut self, c: char, quote: Quote) {
        match self.segments.last_mut() {
            Some((text, q)) if *q == quote => text.push(c),
            _ => self.segments.push((c.to_string(), quote)),
        }
    }

    /// Text with environment variables expanded outside single quotes.
    fn expand<F>(&self, lookup: &F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        self.segments
            .iter()
            .map(|(text, quote)| match quote {
                Quote::Single => text.clone(),
                _ => expand_vars(text, lookup),
            })
            .collect()
    }

    /// Whether an unquoted segment carries a wildcard.
    fn has_wildcard(&self) -> bool {
        self.segments
            .iter()
            .any(|(text, quote)| *quote == Quote::None && text.contains(['*', '?']))
    }
}

/// A tokenized command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    words: Vec<Word>,
}

impl CommandLine {
    /// Split a command string into words.
    pub fn parse(command: &str) -> Result<Self, CommandError> {
        let mut words = Vec::new();
        let mut current: Option<Word> = None;
        let mut quote = Quote::None;
        let mut chars = command.chars();

        while let Some(c) = chars.next() {
            match (quote, c) {
                (Quote::None, c) if c.is_whitespace() => {
                    if let Some(word) = current.take() {
                        words.push(word);
                    }
                }
                (Quote::None, '\'') => {
                    quote = Quote::Single;
                    current.get_or_insert_with(empty_word);
                }
                (Quote::None, '"') => {
                    quote = Quote::Double;
                    current.get_or_insert_with(empty_word);
                }
                (Quote::Single, '\'') | (Quote::Double, '"') => quote = Quote::None,
                (Quote::None, '\\') => {
                    let escaped = chars.next().ok_or_else(|| CommandError::TrailingEscape {
                        command: command.to_string(),
                    })?;
                    // An escaped character never globs or expands.
                    current.get_or_insert_with(empty_word).push(escaped, Quote::Single);
                }
                (Quote::Double, '\\') => {
                    let escaped = chars.next().ok_or_else(|| CommandError::TrailingEscape {
                        command: command.to_string(),
                    })?;
                    let word = current.get_or_insert_with(empty_word);
                    if matches!(escaped, '"' | '\\' | '$') {
                        word.push(escaped, Quote::Single);
                    } else {
                        word.push('\\', Quote::Double);
                        word.push(escaped, Quote::Double);
                    }
                }
                (q, c) => current.get_or_insert_with(empty_word).push(c, q),
            }
        }

        if quote != Quote::None {
            return Err(CommandError::UnterminatedQuote {
                command: command.to_string(),
            });
        }
        words.extend(current);
        if words.is_empty() {
            return Err(CommandError::Empty);
        }
        Ok(Self { words })
    }

    /// Resolve against the process environment and a working directory.
    pub fn resolve(&self, registry: &ExecutableRegistry, workdir: &Path) -> Vec<String> {
        self.resolve_with(registry, workdir, |name| std::env::var(name).ok())
    }

    /// Resolve with an explicit environment lookup.
    pub fn resolve_with<F>(
        &self,
        registry: &ExecutableRegistry,
        workdir: &Path,
        lookup: F,
    ) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut argv = Vec::new();
        for word in &self.words {
            let text = word.expand(&lookup);
            if word.has_wildcard() {
                let matches = expand_glob(&text, workdir);
                if matches.is_empty() {
                    argv.push(text);
                } else {
                    argv.extend(matches);
                }
            } else {
                argv.push(text);
            }
        }
        registry.apply(argv)
    }
}

fn empty_word() -> Word {
    Word {
        segments: Vec::new(),
    }
}

/// Expand `$NAME` and `${NAME}`; unknown or malformed references stay literal.
fn expand_vars<F>(text: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) if is_var_name(&braced[..end]) => (&braced[..end], end + 2),
                _ => ("", 0),
            }
        } else {
            let len = after
                .char_indices()
                .take_while(|(_, c)| c.is_ascii_alphanumeric() || *c == '_')
                .map(|(i, c)| i + c.len_utf8())
                .last()
                .unwrap_or(0);
            if is_var_name(&after[..len]) {
                (&after[..len], len)
            } else {
                ("", 0)
            }
        };

        let reference = &rest[pos..pos + 1 + consumed];
        match (consumed, lookup(name)) {
            (0, _) => out.push('$'),
            (_, Some(value)) => out.push_str(&value),
            (_, None) => out.push_str(reference),
        }
        rest = &rest[pos + 1 + consumed..];
    }
    out.push_str(rest);
    out
}

fn is_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Match a wildcard pattern against the working directory.
///
/// Only the final path component may carry wildcards. Results are sorted and
/// keep the directory prefix as written.
fn expand_glob(pattern: &str, workdir: &Path) -> Vec<String> {
    let (prefix, file_pattern) = match pattern.rfind('/') {
        Some(pos) => (&pattern[..=pos], &pattern[pos + 1..]),
        None => ("", pattern),
    };
    if prefix.contains(['*', '?']) {
        return Vec::new();
    }

    let dir = workdir.join(prefix);
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut matches: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.') || file_pattern.starts_with('.'))
        .filter(|name| wildcard_match(file_pattern, name))
        .map(|name| format!("{prefix}{name}"))
        .collect();
    matches.sort();
    matches
}

/// `*` matches any run of characters, `?` exactly one.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// Maps executable aliases to invocations.
///
/// Passed explicitly to every task; entries absent from the registry run as
/// declared.
#[derive(Debug, Clone, Default)]
pub struct ExecutableRegistry {
    aliases: BTreeMap<String, Vec<String>>,
}

impl ExecutableRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in aliases.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (alias, invocation) in [
            ("skgen", "skgen.sh"),
            ("dftb", "dftb+"),
            ("bands", "dp_bands band.out bands"),
        ] {
            registry.aliases.insert(
                alias.to_string(),
                invocation.split_whitespace().map(str::to_string).collect(),
            );
        }
        registry
    }

    /// Built-in aliases overlaid with configured ones.
    pub fn from_config(aliases: &BTreeMap<String, String>) -> Result<Self, CommandError> {
        let mut registry = Self::with_defaults();
        for (alias, invocation) in aliases {
            registry.insert(alias, invocation)?;
        }
        Ok(registry)
    }

    /// Register or replace an alias.
    pub fn insert(&mut self, alias: &str, invocation: &str) -> Result<(), CommandError> {
        let line = CommandLine::parse(invocation)?;
        let words = line
            .words
            .iter()
            .map(|w| w.segments.iter().map(|(t, _)| t.as_str()).collect())
            .collect();
        self.aliases.insert(alias.to_string(), words);
        Ok(())
    }

    /// Invocation for an alias, if registered.
    pub fn get(&self, alias: &str) -> Option<&[String]> {
        self.aliases.get(alias).map(Vec::as_slice)
    }

    /// Replace the first word of `argv` by its invocation.
    pub fn apply(&self, mut argv: Vec<String>) -> Vec<String> {
        let Some(first) = argv.first() else {
            return argv;
        };
        match self.aliases.get(first) {
            Some(invocation) => {
                let mut resolved = invocation.clone();
                resolved.extend(argv.drain(1..));
                resolved
            }
            None => argv,
        }
    }
}

/// Command parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,
    #[error("Unterminated quote in command: {command}")]
    UnterminatedQuote { command: String },
    #[error("Trailing backslash in command: {command}")]
    TrailingEscape { command: String },
}
