//! Line-oriented key rewriting for the consensus client's `config.toml`.
//!
//! A line matches key `k` when it starts with `k`, followed by zero or more
//! spaces and then `=`. Matching lines are replaced wholesale; every other
//! byte of the file, line terminators included, is left untouched.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub key: String,
    pub line: String,
}

impl Substitution {
    /// `key = "value"`
    pub fn quoted(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            line: format!("{key} = \"{value}\""),
        }
    }

    /// `key = value`
    pub fn bare(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            line: format!("{key} = {value}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    pub contents: String,
    /// Keys that had no matching line.
    pub missing: Vec<String>,
    pub replaced: usize,
}

pub fn apply(contents: &str, substitutions: &[Substitution]) -> PatchOutcome {
    let mut hits = vec![0usize; substitutions.len()];
    let mut patched = String::with_capacity(contents.len());

    for raw in contents.split_inclusive('\n') {
        let (body, terminator) = split_terminator(raw);
        match substitutions
            .iter()
            .position(|substitution| matches_key(body, &substitution.key))
        {
            Some(index) => {
                hits[index] += 1;
                patched.push_str(&substitutions[index].line);
            }
            None => patched.push_str(body),
        }
        patched.push_str(terminator);
    }

    let missing = substitutions
        .iter()
        .zip(&hits)
        .filter(|(_, count)| **count == 0)
        .map(|(substitution, _)| substitution.key.clone())
        .collect();

    PatchOutcome {
        contents: patched,
        missing,
        replaced: hits.iter().sum(),
    }
}

fn split_terminator(raw: &str) -> (&str, &str) {
    if let Some(body) = raw.strip_suffix("\r\n") {
        (body, &raw[body.len()..])
    } else if let Some(body) = raw.strip_suffix('\n') {
        (body, &raw[body.len()..])
    } else {
        (raw, "")
    }
}

fn matches_key(line: &str, key: &str) -> bool {
    line.strip_prefix(key)
        .map(|rest| rest.trim_start_matches(' ').starts_with('='))
        .unwrap_or(false)
}
