use std::collections::BTreeSet;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_DECK: &str = "Obsidian";

#[derive(Debug, Error)]
pub enum DeckRuleError {
    #[error("failed to read deck rules {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid deck rules {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("deck rule #{index} must set exactly one of path, tag or any")]
    Ambiguous { index: usize },
    #[error("deck rule #{index} has an empty deck name")]
    EmptyDeck { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatcher {
    /// Matches files at or below this vault-relative directory or file.
    Path(PathBuf),
    Tag(String),
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeckRule {
    pub matcher: RuleMatcher,
    pub deck: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    any: bool,
    deck: String,
}

impl DeckRule {
    fn from_raw(index: usize, raw: RawRule) -> Result<Self, DeckRuleError> {
        if raw.deck.trim().is_empty() {
            return Err(DeckRuleError::EmptyDeck { index });
        }
        let matcher = match (raw.path, raw.tag, raw.any) {
            (Some(path), None, false) => RuleMatcher::Path(PathBuf::from(path)),
            (None, Some(tag), false) => RuleMatcher::Tag(normalize_tag(&tag).to_string()),
            (None, None, true) => RuleMatcher::Any,
            _ => return Err(DeckRuleError::Ambiguous { index }),
        };
        Ok(Self {
            matcher,
            deck: raw.deck,
        })
    }
}

pub fn normalize_tag(tag: &str) -> &str {
    tag.trim().trim_start_matches('#')
}

/// Resolves the target deck for a card. Precedence: override, first matching
/// path rule, first matching tag rule, wildcard, default deck.
#[derive(Debug, Clone)]
pub struct DeckRouter {
    rules: Vec<DeckRule>,
    default_deck: String,
    override_deck: Option<String>,
}

impl Default for DeckRouter {
    fn default() -> Self {
        Self::new(DEFAULT_DECK)
    }
}

impl DeckRouter {
    pub fn new(default_deck: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            default_deck: default_deck.into(),
            override_deck: None,
        }
    }

    pub fn with_rules(mut self, rules: Vec<DeckRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_override(mut self, deck: Option<String>) -> Self {
        self.override_deck = deck.filter(|deck| !deck.trim().is_empty());
        self
    }

    pub fn parse_rules(bytes: &[u8], path: &Path) -> Result<Vec<DeckRule>, DeckRuleError> {
        let raw: Vec<RawRule> =
            serde_json::from_slice(bytes).map_err(|source| DeckRuleError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        raw.into_iter()
            .enumerate()
            .map(|(index, rule)| DeckRule::from_raw(index, rule))
            .collect()
    }

    pub fn load_rules(path: &Path) -> Result<Vec<DeckRule>, DeckRuleError> {
        let bytes = std::fs::read(path).map_err(|source| DeckRuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_rules(&bytes, path)
    }

    pub fn resolve(&self, path: &str, tags: &BTreeSet<String>) -> String {
        if let Some(deck) = &self.override_deck {
            return deck.clone();
        }
        let file = Path::new(path);
        let by_path = self.rules.iter().find(|rule| match &rule.matcher {
            RuleMatcher::Path(prefix) => path_matches(file, prefix),
            _ => false,
        });
        let by_tag = || {
            self.rules.iter().find(|rule| match &rule.matcher {
                RuleMatcher::Tag(tag) => tags.iter().any(|t| normalize_tag(t) == tag),
                _ => false,
            })
        };
        let wildcard = || {
            self.rules
                .iter()
                .find(|rule| rule.matcher == RuleMatcher::Any)
        };
        by_path
            .or_else(by_tag)
            .or_else(wildcard)
            .map(|rule| rule.deck.clone())
            .unwrap_or_else(|| self.default_deck.clone())
    }
}

fn path_matches(file: &Path, prefix: &Path) -> bool {
    let normal = |path: &Path| -> Vec<String> {
        path.components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect()
    };
    let prefix = normal(prefix);
    !prefix.is_empty() && normal(file).starts_with(&prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn router() -> DeckRouter {
        let rules = DeckRouter::parse_rules(
            br##"[
                {"tag": "#physics", "deck": "Physics"},
                {"path": "Uni/Math", "deck": "Math"},
                {"any": true, "deck": "Misc"}
            ]"##,
            Path::new("rules.json"),
        )
        .unwrap();
        DeckRouter::default().with_rules(rules)
    }

    #[test]
    fn path_rule_beats_tag_rule() {
        assert_eq!(
            router().resolve("Uni/Math/Analysis.md", &tags(&["physics"])),
            "Math"
        );
    }

    #[test]
    fn tag_rule_applies_when_no_path_matches() {
        assert_eq!(router().resolve("Uni/Physik.md", &tags(&["physics"])), "Physics");
    }

    #[test]
    fn path_prefix_matches_whole_components() {
        assert_eq!(router().resolve("Uni/Mathematik.md", &tags(&[])), "Misc");
    }

    #[test]
    fn falls_back_to_default_without_wildcard() {
        assert_eq!(DeckRouter::default().resolve("a.md", &tags(&["x"])), "Obsidian");
    }

    #[test]
    fn override_wins() {
        let router = router().with_override(Some("Exam".to_string()));
        assert_eq!(router.resolve("Uni/Math/a.md", &tags(&[])), "Exam");
    }

    #[test]
    fn rejects_rules_with_two_matchers() {
        let err = DeckRouter::parse_rules(
            br#"[{"path": "a", "tag": "b", "deck": "X"}]"#,
            Path::new("rules.json"),
        )
        .unwrap_err();
        assert!(matches!(err, DeckRuleError::Ambiguous { index: 0 }));
    }
}
