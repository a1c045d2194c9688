//! Tag matching for lookups and cancellation.

use std::collections::BTreeSet;

use crate::error::JobQueueError;

/// How a tag query is matched against a job's tags.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TagConstraint {
    /// Every queried tag must be present on the job.
    All,
    /// At least one queried tag must be present on the job.
    Any,
}

impl TagConstraint {
    pub fn matches(&self, query: &TagQuery, job_tags: &BTreeSet<String>) -> bool {
        match self {
            TagConstraint::Any => query.tags.iter().any(|t| job_tags.contains(t)),
            TagConstraint::All => query.tags.iter().all(|t| job_tags.contains(t)),
        }
    }
}

/// A validated, non-empty set of tags to match against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagQuery {
    tags: BTreeSet<String>,
}

impl TagQuery {
    pub fn new<I, T>(tags: I) -> Result<Self, JobQueueError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let tags: BTreeSet<String> = tags.into_iter().map(Into::into).collect();
        if tags.is_empty() {
            return Err(JobQueueError::invalid_tag_query("at least one tag is required"));
        }
        if tags.iter().any(String::is_empty) {
            return Err(JobQueueError::invalid_tag_query("tags must not be empty strings"));
        }
        Ok(Self { tags })
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn any_needs_one_overlap() {
        let query = TagQuery::new(["a", "z"]).unwrap();
        assert!(TagConstraint::Any.matches(&query, &set(&["a", "b"])));
        assert!(!TagConstraint::Any.matches(&query, &set(&["b", "c"])));
    }

    #[test]
    fn all_needs_every_tag() {
        let query = TagQuery::new(["a", "b"]).unwrap();
        assert!(TagConstraint::All.matches(&query, &set(&["a", "b", "c"])));
        assert!(!TagConstraint::All.matches(&query, &set(&["a", "c"])));
    }

    #[test]
    fn rejects_empty_queries() {
        assert!(TagQuery::new(Vec::<String>::new()).is_err());
        assert!(TagQuery::new(["a", ""]).is_err());
    }

    proptest! {
        /// Property: a job always matches ALL and ANY for a non-empty subset of its own tags.
        #[test]
        fn subset_queries_match(tags in prop::collection::btree_set("[a-z]{1,6}", 1..8), take in 1usize..8) {
            let subset: Vec<String> = tags.iter().take(take).cloned().collect();
            let query = TagQuery::new(subset).unwrap();
            prop_assert!(TagConstraint::All.matches(&query, &tags));
            prop_assert!(TagConstraint::Any.matches(&query, &tags));
        }

        /// Property: ALL implies ANY.
        #[test]
        fn all_implies_any(
            job in prop::collection::btree_set("[a-d]", 0..4),
            query in prop::collection::btree_set("[a-d]", 1..4),
        ) {
            let query = TagQuery::new(query).unwrap();
            if TagConstraint::All.matches(&query, &job) {
                prop_assert!(TagConstraint::Any.matches(&query, &job));
            }
        }
    }
}
