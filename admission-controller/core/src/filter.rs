use anyhow::{Context, Result};
use regex::Regex;

/// Namespace admission policy, compiled once at startup.
///
/// Two independent decisions are derived from four pattern lists: whether pods
/// in a namespace are mutated at all, and whether they additionally receive
/// scheduling labels. The *process* and *label* lists are permissive when
/// empty; the *bypass* and *no-label* lists only ever opt namespaces out.
#[derive(Debug, Default)]
pub struct NamespaceFilter {
    process: Vec<Regex>,
    bypass: Vec<Regex>,
    label: Vec<Regex>,
    no_label: Vec<Regex>,
}

impl NamespaceFilter {
    pub fn new(process: &str, bypass: &str, label: &str, no_label: &str) -> Result<Self> {
        Ok(Self {
            process: parse_patterns(process)?,
            bypass: parse_patterns(bypass)?,
            label: parse_patterns(label)?,
            no_label: parse_patterns(no_label)?,
        })
    }

    /// Whether pods created in `namespace` are mutated.
    pub fn should_mutate(&self, namespace: &str) -> bool {
        matches_or_empty(&self.process, namespace) && !matches_any(&self.bypass, namespace)
    }

    /// Whether mutated pods in `namespace` also receive scheduling labels.
    pub fn should_label(&self, namespace: &str) -> bool {
        matches_or_empty(&self.label, namespace) && !matches_any(&self.no_label, namespace)
    }
}

/// Reads a comma-separated list of regular expressions. Whitespace around
/// entries is ignored and empty entries are skipped, so `""` yields an empty
/// list. Patterns are searched, not anchored.
pub fn parse_patterns(list: &str) -> Result<Vec<Regex>> {
    let mut patterns = Vec::new();
    for spec in list.split(',') {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        let pattern = Regex::new(spec).with_context(|| format!("invalid pattern {spec:?}"))?;
        patterns.push(pattern);
    }
    Ok(patterns)
}

fn matches_any(patterns: &[Regex], namespace: &str) -> bool {
    patterns.iter().any(|re| re.is_match(namespace))
}

fn matches_or_empty(patterns: &[Regex], namespace: &str) -> bool {
    patterns.is_empty() || matches_any(patterns, namespace)
}
