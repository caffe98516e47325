//! Capability tags and the matcher used for routing.
//!
//! A capability tag is an opaque label (`gpu`, `docker`, `cuda11`, ...) that a
//! worker advertises and a task may require. Routing is a subset test, used
//! twice: once to decide whether a worker may keep a claimed task at all, and
//! once more to pick the in-process handler.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An ordered, de-duplicated set of capability tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Parse a comma-separated tag list (`"gpu, cuda11,,docker"`).
    ///
    /// Tags are trimmed and empty segments dropped.
    pub fn parse(csv: &str) -> Self {
        csv.split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .collect()
    }

    pub fn insert(&mut self, tag: impl Into<String>) -> bool {
        self.0.insert(tag.into())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// `self ⊆ other`.
    pub fn is_subset_of(&self, other: &CapabilitySet) -> bool {
        matches(self, other)
    }
}

/// `required ⊆ provided`.
///
/// An empty `required` set always matches; an empty `provided` set only
/// matches an empty `required` set.
pub fn matches(required: &CapabilitySet, provided: &CapabilitySet) -> bool {
    required.0.iter().all(|tag| provided.0.contains(tag))
}

impl<S: Into<String>> FromIterator<S> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl FromStr for CapabilitySet {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for tag in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            f.write_str(tag)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn caps(csv: &str) -> CapabilitySet {
        CapabilitySet::parse(csv)
    }

    #[rstest]
    #[case::empty_matches_anything("", "cpu", true)]
    #[case::empty_matches_empty("", "", true)]
    #[case::gpu_on_cpu_worker("gpu", "cpu", false)]
    #[case::gpu_on_gpu_worker("gpu", "gpu,cuda11", true)]
    #[case::partial_overlap("gpu,docker", "gpu,cuda11", false)]
    #[case::nothing_provided("gpu", "", false)]
    fn subset_truth_table(#[case] required: &str, #[case] provided: &str, #[case] expected: bool) {
        assert_eq!(matches(&caps(required), &caps(provided)), expected);
    }

    #[test]
    fn parse_trims_and_deduplicates() {
        let set = caps(" gpu , cuda11,,gpu ");
        assert_eq!(set.len(), 2);
        assert!(set.contains("gpu"));
        assert!(set.contains("cuda11"));
    }

    #[test]
    fn display_is_sorted_csv() {
        let set = caps("docker,gpu,cpu");
        assert_eq!(set.to_string(), "cpu,docker,gpu");
        assert_eq!(caps(&set.to_string()), set);
    }

    #[test]
    fn serializes_as_list() {
        let set = caps("gpu,cpu");
        let v = serde_json::to_value(&set).unwrap();
        assert_eq!(v, serde_json::json!(["cpu", "gpu"]));
    }
}
