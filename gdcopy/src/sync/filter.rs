use regex::{Regex, RegexBuilder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid ignore pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Name filter built from extension patterns such as `tmp$` or `mp4|mkv`.
///
/// Each pattern is anchored as `\.(?:pattern)$` and matched case-insensitively
/// against the item name.
#[derive(Debug, Clone, Default)]
pub struct IgnoreFilter {
    patterns: Vec<Regex>,
}

impl IgnoreFilter {
    pub fn new<I, P>(patterns: I) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| compile(pattern.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(name))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn compile(pattern: &str) -> Result<Regex, FilterError> {
    // Patterns written with a trailing `$` stay valid inside the group.
    RegexBuilder::new(&format!(r"\.(?:{pattern})$"))
        .case_insensitive(true)
        .build()
        .map_err(|source| FilterError::Pattern {
            pattern: pattern.to_string(),
            source,
        })
}
