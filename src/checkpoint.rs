use crate::block::Block;
use crate::source::{BlockQuery, BlockSource, SourceError};
use crate::Result;
use chrono::{DateTime, Utc};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded exponential backoff for block lookups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget without sleeping, for tests
    pub fn immediate() -> Self {
        Self {
            base_wait: Duration::ZERO,
            max_wait: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Wait after the given failed attempt (1-based)
    pub fn wait_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_wait.saturating_mul(factor).min(self.max_wait)
    }
}

/// Finds the block a run should pin each partition to
pub struct CheckpointResolver {
    source: Box<dyn BlockSource>,
    skip_invalid_blocks: usize,
    policy: RetryPolicy,
}

impl CheckpointResolver {
    pub fn new(source: Box<dyn BlockSource>, skip_invalid_blocks: usize) -> Self {
        Self {
            source,
            skip_invalid_blocks,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The query sent for a resolution. The newest blocks are skipped because
    /// indexers may not have processed them yet; an `until` bound replaces
    /// both the skip and the lower bound.
    pub fn block_query(&self, previous: Option<&Block>, until: Option<DateTime<Utc>>) -> BlockQuery {
        match until {
            Some(until) => BlockQuery {
                first: 1,
                skip: None,
                number_gte: None,
                timestamp_lte: Some(until),
            },
            None => BlockQuery {
                first: 1,
                skip: Some(self.skip_invalid_blocks),
                number_gte: Some(previous.map(|b| b.number).unwrap_or(0)),
                timestamp_lte: None,
            },
        }
    }

    /// Resolve the block for `partition`.
    ///
    /// Without `until` the answer is never behind `previous`. When the
    /// upstream has no matching block, `previous` is returned unchanged.
    pub fn resolve(
        &self,
        partition: &str,
        previous: Option<&Block>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Option<Block>> {
        let query = self.block_query(previous, until);
        let blocks = self.query_with_retry(partition, &query)?;

        let Some(found) = blocks.into_iter().max() else {
            warn!(partition, ?query, "Blocks query returned no response");
            return Ok(previous.cloned());
        };

        if until.is_none() && found.is_older_than(previous) {
            warn!(partition, found = found.number, "Upstream returned a block behind the previous one");
            return Ok(previous.cloned());
        }

        debug!(partition, block = %found, "Resolved block");
        Ok(Some(found))
    }

    fn query_with_retry(&self, partition: &str, query: &BlockQuery) -> std::result::Result<Vec<Block>, SourceError> {
        let mut attempt = 1;
        loop {
            match self.source.query_blocks(partition, query) {
                Ok(blocks) => return Ok(blocks),
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let wait = self.policy.wait_after(attempt);
                    warn!(partition, attempt, error = %e, ?wait, "Retrying blocks query");
                    thread::sleep(wait);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncError;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    struct ScriptedBlocks {
        answers: RefCell<VecDeque<std::result::Result<Vec<Block>, SourceError>>>,
        seen: Rc<RefCell<Vec<BlockQuery>>>,
    }

    impl ScriptedBlocks {
        fn new(answers: Vec<std::result::Result<Vec<Block>, SourceError>>) -> (Self, Rc<RefCell<Vec<BlockQuery>>>) {
            let seen = Rc::new(RefCell::new(Vec::new()));
            (
                Self {
                    answers: RefCell::new(answers.into()),
                    seen: seen.clone(),
                },
                seen,
            )
        }
    }

    impl BlockSource for ScriptedBlocks {
        fn query_blocks(&self, _partition: &str, query: &BlockQuery) -> std::result::Result<Vec<Block>, SourceError> {
            self.seen.borrow_mut().push(query.clone());
            self.answers.borrow_mut().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn resolver(answers: Vec<std::result::Result<Vec<Block>, SourceError>>) -> (CheckpointResolver, Rc<RefCell<Vec<BlockQuery>>>) {
        let (source, seen) = ScriptedBlocks::new(answers);
        (
            CheckpointResolver::new(Box::new(source), 250).with_policy(RetryPolicy::immediate()),
            seen,
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.wait_after(1), Duration::from_secs(1));
        assert_eq!(policy.wait_after(2), Duration::from_secs(2));
        assert_eq!(policy.wait_after(4), Duration::from_secs(8));
        assert_eq!(policy.wait_after(5), Duration::from_secs(10));
        assert_eq!(policy.wait_after(64), Duration::from_secs(10));
    }

    #[test]
    fn test_resolves_from_genesis() {
        let (resolver, seen) = resolver(vec![Ok(vec![Block::at_unix("0x1", 100, 0)])]);
        let block = resolver.resolve("p1", None, None).unwrap().unwrap();
        assert_eq!(block.number, 100);

        let query = &seen.borrow()[0];
        assert_eq!(query.number_gte, Some(0));
        assert_eq!(query.skip, Some(250));
    }

    #[test]
    fn test_retries_query_errors_three_times() {
        let (resolver, seen) = resolver(vec![
            Err(SourceError::Query("indexing".into())),
            Err(SourceError::Query("indexing".into())),
            Ok(vec![Block::at_unix("0x2", 7, 0)]),
        ]);
        let block = resolver.resolve("p1", None, None).unwrap().unwrap();
        assert_eq!(block.number, 7);
        assert_eq!(seen.borrow().len(), 3);
    }

    #[test]
    fn test_gives_up_after_three_attempts() {
        let (resolver, seen) = resolver(vec![
            Err(SourceError::Query("a".into())),
            Err(SourceError::Query("b".into())),
            Err(SourceError::Query("c".into())),
            Ok(vec![Block::at_unix("0x2", 7, 0)]),
        ]);
        let err = resolver.resolve("p1", None, None).unwrap_err();
        assert!(matches!(err, SyncError::Source(SourceError::Query(ref m)) if m == "c"));
        assert_eq!(seen.borrow().len(), 3);
    }

    #[test]
    fn test_transport_errors_not_retried() {
        let (resolver, seen) = resolver(vec![Err(SourceError::Transport("refused".into()))]);
        assert!(resolver.resolve("p1", None, None).is_err());
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_empty_answer_keeps_previous() {
        let previous = Block::at_unix("0x9", 900, 0);
        let (resolver, _) = resolver(vec![Ok(Vec::new())]);
        let block = resolver.resolve("p1", Some(&previous), None).unwrap();
        assert_eq!(block, Some(previous));

        let (resolver, _) = self::resolver(vec![Ok(Vec::new())]);
        assert_eq!(resolver.resolve("p1", None, None).unwrap(), None);
    }

    #[test]
    fn test_never_moves_behind_previous() {
        let previous = Block::at_unix("0x9", 900, 0);
        for number in [10, 899, 900, 901, 5_000] {
            let (resolver, _) = resolver(vec![Ok(vec![Block::at_unix("0xn", number, 0)])]);
            let block = resolver.resolve("p1", Some(&previous), None).unwrap().unwrap();
            assert!(block.number >= previous.number);
        }
    }

    #[test]
    fn test_until_replaces_skip_and_lower_bound() {
        let previous = Block::at_unix("0x9", 900, 0);
        let until = Block::at_unix("x", 0, 1_600_000_000).timestamp;
        let (resolver, seen) = resolver(vec![Ok(vec![Block::at_unix("0x3", 300, 1_599_999_990)])]);

        let block = resolver.resolve("p1", Some(&previous), Some(until)).unwrap().unwrap();
        assert_eq!(block.number, 300);

        let query = &seen.borrow()[0];
        assert_eq!(query.skip, None);
        assert_eq!(query.number_gte, None);
        assert_eq!(query.timestamp_lte, Some(until));
    }
}
