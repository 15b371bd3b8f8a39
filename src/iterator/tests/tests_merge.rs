//! `MergingIterator` over in-memory children.
//!
//! Coverage:
//! - Forward and reverse order across interleaved children
//! - Duplicate keys: earliest child wins, key surfaces once
//! - Direction changes mid-scan, including a child that fails to re-seek
//! - `has_next` / `has_prev` at both ends
//! - Close aggregation and use-after-close

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::iterator::tests::helpers::{VecIterator, vec_iter};
    use crate::iterator::{Direction, IteratorError, MergingIterator, SeekIterator};
    use crate::key::{CodeThenTime, InternalKey, KeyComparator};
    use crate::level::tests::helpers::{drain, init_tracing};

    fn merger(children: Vec<VecIterator>) -> MergingIterator<VecIterator> {
        init_tracing();
        let cmp: Arc<dyn KeyComparator> = Arc::new(CodeThenTime);
        MergingIterator::new(children, cmp)
    }

    fn interleaved() -> MergingIterator<VecIterator> {
        merger(vec![
            vec_iter(&[(1, 1, "a1"), (1, 3, "a3"), (1, 5, "a5")]),
            vec_iter(&[(1, 2, "b2"), (1, 3, "b3"), (1, 4, "b4")]),
        ])
    }

    fn times(items: &[(u32, u64, String)]) -> Vec<u64> {
        items.iter().map(|(_, t, _)| *t).collect()
    }

    #[test]
    fn forward_merges_in_key_order() {
        let mut m = interleaved();
        let out = drain(&mut m);
        assert_eq!(times(&out), vec![1, 2, 3, 4, 5]);
        assert_eq!(out[2].2, "a3");
        assert!(!m.valid());
    }

    #[test]
    fn reverse_after_exhaustion_walks_back() {
        let mut m = interleaved();
        drain(&mut m);

        let mut back = Vec::new();
        while let Some((k, v)) = m.prev().unwrap() {
            back.push((k.time, String::from_utf8(v).unwrap()));
        }
        let back_times: Vec<u64> = back.iter().map(|(t, _)| *t).collect();
        assert_eq!(back_times, vec![5, 4, 3, 2, 1]);
        assert_eq!(back[2].1, "a3");
        assert_eq!(m.direction(), Direction::Reverse);
    }

    /// # Scenario
    /// `(1, 10)` maps to `"a"` in the first child and `"b"` in the second.
    ///
    /// # Expected behavior
    /// The key is produced once, with the first child's value, in both
    /// directions.
    #[test]
    fn duplicate_key_taken_from_first_child_once() {
        let mut m = merger(vec![
            vec_iter(&[(1, 10, "a")]),
            vec_iter(&[(1, 10, "b")]),
        ]);
        let out = drain(&mut m);
        assert_eq!(out, vec![(1, 10, "a".to_string())]);

        let back = m.prev().unwrap().unwrap();
        assert_eq!(back.1, b"a");
        assert_eq!(m.current_index(), Some(0));
        assert_eq!(m.prev().unwrap(), None);
    }

    #[test]
    fn direction_change_mid_scan() {
        let mut m = interleaved();
        for _ in 0..4 {
            m.next().unwrap();
        }
        assert_eq!(m.key(), Some(InternalKey::new(1, 4)));

        let (k, v) = m.prev().unwrap().unwrap();
        assert_eq!((k.time, v.as_slice()), (3, b"a3".as_slice()));
        assert_eq!(m.prev().unwrap().unwrap().0.time, 2);
        assert_eq!(m.next().unwrap().unwrap().0.time, 3);
        assert_eq!(m.next().unwrap().unwrap().0.time, 4);
        assert_eq!(m.next().unwrap().unwrap().0.time, 5);
        assert_eq!(m.next().unwrap(), None);
    }

    #[test]
    fn seek_lands_in_gap_before_target() {
        let mut m = interleaved();
        m.seek(&InternalKey::new(1, 3)).unwrap();
        assert!(!m.valid());
        assert_eq!(m.next().unwrap().unwrap().1, b"a3");

        m.seek(&InternalKey::new(1, 3)).unwrap();
        assert_eq!(m.prev().unwrap().unwrap().0.time, 2);

        m.seek(&InternalKey::new(2, 0)).unwrap();
        assert!(!m.has_next().unwrap());
        assert!(m.has_prev().unwrap());
        assert_eq!(m.prev().unwrap().unwrap().0.time, 5);
    }

    #[test]
    fn has_next_and_has_prev_at_the_ends() {
        let mut m = interleaved();
        assert!(m.has_next().unwrap());
        assert!(!m.has_prev().unwrap());

        m.next().unwrap();
        assert!(!m.has_prev().unwrap());
        assert!(m.has_next().unwrap());
        // Probing must not move the cursor.
        assert_eq!(m.key(), Some(InternalKey::new(1, 1)));
        assert_eq!(m.next().unwrap().unwrap().0.time, 2);
        assert!(m.has_prev().unwrap());
        assert_eq!(m.next().unwrap().unwrap().0.time, 3);

        for _ in 0..2 {
            m.next().unwrap();
        }
        assert_eq!(m.key(), Some(InternalKey::new(1, 5)));
        assert!(!m.has_next().unwrap());
        assert_eq!(m.next().unwrap(), None);
    }

    #[test]
    fn empty_children_and_empty_merge() {
        let mut m = merger(vec![vec_iter(&[]), vec_iter(&[(1, 1, "x")]), vec_iter(&[])]);
        assert_eq!(drain(&mut m).len(), 1);

        let mut none = merger(Vec::new());
        assert_eq!(none.next().unwrap(), None);
        assert_eq!(none.prev().unwrap(), None);
        assert!(!none.has_next().unwrap());
    }

    /// # Scenario
    /// Three children, two of which fail to close.
    ///
    /// # Expected behavior
    /// Every child is closed, both failures are reported together, and
    /// further movement fails with `Closed`.
    #[test]
    fn close_reports_every_failure() {
        let mut m = merger(vec![
            vec_iter(&[(1, 1, "a")]).failing_close(),
            vec_iter(&[(1, 2, "b")]),
            vec_iter(&[(1, 3, "c")]).failing_close(),
        ]);
        m.next().unwrap();

        match m.close() {
            Err(IteratorError::Close(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregated close error, got {other:?}"),
        }
        assert!(m.children().iter().all(|c| c.is_closed()));
        assert!(m.is_closed());
        assert!(!m.valid());
        assert!(matches!(m.next(), Err(IteratorError::Closed)));
        assert!(matches!(m.seek(&InternalKey::new(1, 1)), Err(IteratorError::Closed)));
        m.close().unwrap();
    }

    /// # Scenario
    /// Walk forward to `4`, then turn back while the last non-frontier child
    /// cannot seek. Clear the fault and turn back again.
    ///
    /// # Expected behavior
    /// The failed `prev` surfaces the seek error; the retry lands on `3`
    /// and the reverse walk continues in order.
    #[test]
    fn failed_reverse_resync_is_reported_and_retryable() {
        let fault = Arc::new(AtomicBool::new(false));
        let mut m = merger(vec![
            vec_iter(&[(1, 1, "a1"), (1, 4, "a4"), (1, 7, "a7")]),
            vec_iter(&[(1, 2, "b2"), (1, 5, "b5")]),
            vec_iter(&[(1, 3, "c3"), (1, 6, "c6")]).failing_seek_when(Arc::clone(&fault)),
        ]);
        m.seek(&InternalKey::new(1, 0)).unwrap();
        for expected in 1..=4 {
            assert_eq!(m.next().unwrap().map(|(k, _)| k.time), Some(expected));
        }

        fault.store(true, Ordering::SeqCst);
        assert!(matches!(m.prev(), Err(IteratorError::Io(_))));

        fault.store(false, Ordering::SeqCst);
        let (k, v) = m.prev().unwrap().unwrap();
        assert_eq!((k.time, v.as_slice()), (3, b"c3".as_slice()));
        assert_eq!(m.prev().unwrap().map(|(k, _)| k.time), Some(2));
        assert_eq!(m.prev().unwrap().map(|(k, _)| k.time), Some(1));
        assert_eq!(m.prev().unwrap(), None);
    }

    /// # Scenario
    /// After turning back onto `3`, turn forward while a non-frontier child
    /// cannot seek, then retry once the fault clears.
    ///
    /// # Expected behavior
    /// The failed `next` surfaces the seek error; the retry lands on `4`.
    #[test]
    fn failed_forward_resync_is_reported_and_retryable() {
        let fault = Arc::new(AtomicBool::new(false));
        let mut m = merger(vec![
            vec_iter(&[(1, 1, "a1"), (1, 4, "a4"), (1, 7, "a7")]),
            vec_iter(&[(1, 2, "b2"), (1, 5, "b5")]).failing_seek_when(Arc::clone(&fault)),
            vec_iter(&[(1, 3, "c3"), (1, 6, "c6")]),
        ]);
        m.seek(&InternalKey::new(1, 0)).unwrap();
        for _ in 1..=4 {
            m.next().unwrap();
        }
        assert_eq!(m.prev().unwrap().map(|(k, _)| k.time), Some(3));

        fault.store(true, Ordering::SeqCst);
        assert!(matches!(m.next(), Err(IteratorError::Io(_))));

        fault.store(false, Ordering::SeqCst);
        let times: Vec<u64> = std::iter::from_fn(|| m.next().unwrap())
            .map(|(k, _)| k.time)
            .collect();
        assert_eq!(times, vec![4, 5, 6, 7]);
    }
}
