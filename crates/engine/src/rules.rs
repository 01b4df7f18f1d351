//! Declarative extraction rules.
//!
//! A rule says where embedded media may live (a path pattern), how to name the
//! extracted blob, and what to put back in the document once it is stored.
//! New document shapes are supported by registering another rule.

use std::fmt;
use std::str::FromStr;

use crate::blob::BlobReference;
use crate::data_uri::is_embedded_image;
use crate::document::{DocPath, DocumentValue, PathSegment};

// ---------------------------------------------------------------------------
// Path patterns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSegment {
    Key(String),
    AnyKey,
    Index(usize),
    AnyIndex,
}

/// Pattern over `DocPath`s, e.g. `content.pricing[*].image` or `content.images.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern(Vec<PatternSegment>);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("empty pattern")]
    Empty,

    #[error("empty segment in pattern {0:?}")]
    EmptySegment(String),

    #[error("unclosed '[' in pattern segment {0:?}")]
    UnclosedBracket(String),

    #[error("invalid index {0:?}")]
    BadIndex(String),
}

impl PathPattern {
    pub fn new(segments: Vec<PatternSegment>) -> Self {
        Self(segments)
    }

    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let mut segments = Vec::new();
        for part in pattern.split('.') {
            let (name, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };

            match name {
                "" if rest.is_empty() => {
                    return Err(PatternError::EmptySegment(pattern.to_string()))
                }
                "" => {}
                "*" => segments.push(PatternSegment::AnyKey),
                key => segments.push(PatternSegment::Key(key.to_string())),
            }

            while let Some(inner) = rest.strip_prefix('[') {
                let close = inner
                    .find(']')
                    .ok_or_else(|| PatternError::UnclosedBracket(part.to_string()))?;
                let index = &inner[..close];
                segments.push(match index {
                    "*" => PatternSegment::AnyIndex,
                    n => PatternSegment::Index(
                        n.parse()
                            .map_err(|_| PatternError::BadIndex(n.to_string()))?,
                    ),
                });
                rest = &inner[close + 1..];
            }
            if !rest.is_empty() {
                return Err(PatternError::UnclosedBracket(part.to_string()));
            }
        }

        Ok(Self(segments))
    }

    pub fn matches(&self, path: &DocPath) -> bool {
        let segments = path.segments();
        segments.len() == self.0.len()
            && self.0.iter().zip(segments).all(|(pat, seg)| match (pat, seg) {
                (PatternSegment::Key(want), PathSegment::Key(got)) => want == got,
                (PatternSegment::AnyKey, PathSegment::Key(_)) => true,
                (PatternSegment::Index(want), PathSegment::Index(got)) => want == got,
                (PatternSegment::AnyIndex, PathSegment::Index(_)) => true,
                _ => false,
            })
    }
}

impl FromStr for PathPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PatternSegment::Key(k) if i == 0 => write!(f, "{k}")?,
                PatternSegment::Key(k) => write!(f, ".{k}")?,
                PatternSegment::AnyKey if i == 0 => f.write_str("*")?,
                PatternSegment::AnyKey => f.write_str(".*")?,
                PatternSegment::Index(n) => write!(f, "[{n}]")?,
                PatternSegment::AnyIndex => f.write_str("[*]")?,
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// What a naming function can see about a matched leaf.
pub struct RuleContext<'a> {
    pub path: &'a DocPath,
    pub root: &'a DocumentValue,
}

impl<'a> RuleContext<'a> {
    /// A value next to the leaf in the same map.
    pub fn sibling(&self, key: &str) -> Option<&'a DocumentValue> {
        let parent = self.path.parent()?;
        self.root.get_path(&parent.child_key(key))
    }

    pub fn last_key(&self) -> Option<&'a str> {
        self.path.last_key()
    }

    pub fn last_index(&self) -> Option<usize> {
        self.path.last_index()
    }
}

type PredicateFn = dyn Fn(&str) -> bool + Send + Sync;
type NamingFn = dyn Fn(&RuleContext<'_>) -> String + Send + Sync;
type RewriteFn = dyn Fn(&BlobReference) -> DocumentValue + Send + Sync;

pub struct ExtractionRule {
    name: String,
    pattern: PathPattern,
    should_extract: Box<PredicateFn>,
    naming: Box<NamingFn>,
    rewrite: Box<RewriteFn>,
}

impl ExtractionRule {
    /// Rule extracting embedded images at `pattern`, named after the innermost
    /// key and replaced by the blob's public path.
    pub fn new(name: impl Into<String>, pattern: PathPattern) -> Self {
        Self {
            name: name.into(),
            pattern,
            should_extract: Box::new(is_embedded_image),
            naming: Box::new(|ctx: &RuleContext<'_>| {
                ctx.last_key().unwrap_or("blob").to_string()
            }),
            rewrite: Box::new(|blob: &BlobReference| {
                DocumentValue::String(blob.public_path.clone())
            }),
        }
    }

    pub fn with_predicate(mut self, f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.should_extract = Box::new(f);
        self
    }

    pub fn with_naming(
        mut self,
        f: impl Fn(&RuleContext<'_>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.naming = Box::new(f);
        self
    }

    pub fn with_rewrite(
        mut self,
        f: impl Fn(&BlobReference) -> DocumentValue + Send + Sync + 'static,
    ) -> Self {
        self.rewrite = Box::new(f);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    pub fn matches(&self, path: &DocPath) -> bool {
        self.pattern.matches(path)
    }

    pub fn should_extract(&self, value: &str) -> bool {
        (self.should_extract)(value)
    }

    pub fn blob_prefix(&self, ctx: &RuleContext<'_>) -> String {
        (self.naming)(ctx)
    }

    pub fn rewrite(&self, blob: &BlobReference) -> DocumentValue {
        (self.rewrite)(blob)
    }
}

impl fmt::Debug for ExtractionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionRule")
            .field("name", &self.name)
            .field("pattern", &self.pattern.to_string())
            .finish_non_exhaustive()
    }
}

/// Ordered rule registry; the first rule whose pattern matches a path wins.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<ExtractionRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The media locations of the site-content metadata documents.
    pub fn site_content() -> Self {
        let mut rules = Self::new();
        rules.push(ExtractionRule::new("images", content_pattern(&["images", "*"])));
        rules.push(
            ExtractionRule::new("pricing", content_list_image("pricing")).with_naming(|ctx| {
                match ctx.sibling("name").and_then(DocumentValue::as_str) {
                    Some(plan) if !plan.trim().is_empty() => format!("pricing-{plan}"),
                    _ => format!("pricing_{}", ctx.last_index().unwrap_or_default()),
                }
            }),
        );
        rules.push(
            ExtractionRule::new("features", content_list_image("features"))
                .with_naming(|ctx| format!("feature_{}", ctx.last_index().unwrap_or_default())),
        );
        rules.push(
            ExtractionRule::new("products", content_list_image("products"))
                .with_naming(|ctx| format!("product_{}", ctx.last_index().unwrap_or_default())),
        );
        rules
    }

    pub fn push(&mut self, rule: ExtractionRule) {
        self.rules.push(rule);
    }

    pub fn find(&self, path: &DocPath) -> Option<&ExtractionRule> {
        self.rules.iter().find(|r| r.matches(path))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtractionRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn content_pattern(keys: &[&str]) -> PathPattern {
    let mut segments = vec![PatternSegment::Key("content".to_string())];
    segments.extend(keys.iter().map(|k| match *k {
        "*" => PatternSegment::AnyKey,
        k => PatternSegment::Key(k.to_string()),
    }));
    PathPattern::new(segments)
}

fn content_list_image(list: &str) -> PathPattern {
    PathPattern::new(vec![
        PatternSegment::Key("content".to_string()),
        PatternSegment::Key(list.to_string()),
        PatternSegment::AnyIndex,
        PatternSegment::Key("image".to_string()),
    ])
}
