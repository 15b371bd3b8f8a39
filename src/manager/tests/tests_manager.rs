//! `FileManager` allocation, ordering policies and name resolution.

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;

    use tempfile::TempDir;

    use crate::iterator::tests::helpers::{VecIterator, vec_iter};
    use crate::iterator::{LevelIterator, SeekIterator};
    use crate::key::InternalKey;
    use crate::level::tests::helpers::file_manager;
    use crate::segment::{FileMeta, Head};

    fn meta(file_number: u64) -> FileMeta {
        let k = InternalKey::new(1, 1);
        FileMeta::from_head(file_number, PathBuf::from("unused"), &Head::new(k, k, 1))
    }

    /// # Scenario
    /// Eight threads allocate 1000 file numbers each.
    ///
    /// # Expected behavior
    /// All 8000 numbers are distinct and form the range `1..=8000`.
    #[test]
    fn concurrent_allocation_is_unique_and_dense() {
        let tmp = TempDir::new().unwrap();
        let fm = file_manager(tmp.path());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fm = Arc::clone(&fm);
                thread::spawn(move || {
                    (0..1000)
                        .map(|_| fm.allocate_file_number())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for n in h.join().unwrap() {
                assert!(all.insert(n), "file number {n} handed out twice");
            }
        }
        assert_eq!(all.len(), 8000);
        assert_eq!(all.iter().min(), Some(&1));
        assert_eq!(all.iter().max(), Some(&8000));
    }

    #[test]
    fn observe_only_moves_forward() {
        let tmp = TempDir::new().unwrap();
        let fm = file_manager(tmp.path());
        fm.observe_file_number(41);
        assert_eq!(fm.allocate_file_number(), 42);
        fm.observe_file_number(10);
        assert_eq!(fm.allocate_file_number(), 43);
    }

    #[test]
    fn segment_order_is_newest_first() {
        let tmp = TempDir::new().unwrap();
        let fm = file_manager(tmp.path());
        let mut metas = vec![meta(2), meta(7), meta(4)];
        metas.sort_by(|a, b| fm.segment_order(a, b));
        let numbers: Vec<u64> = metas.iter().map(|m| m.file_number).collect();
        assert_eq!(numbers, vec![7, 4, 2]);
        assert_eq!(fm.segment_order(&meta(3), &meta(3)), Ordering::Equal);
    }

    /// # Scenario
    /// Level iterators for levels 2, 0, 1 and a second level 0.
    ///
    /// # Expected behavior
    /// Ascending by level; the two level-0 iterators keep their relative
    /// order under a stable sort.
    #[test]
    fn level_iterator_order_is_ascending_and_stable() {
        let tmp = TempDir::new().unwrap();
        let fm = file_manager(tmp.path());
        let mut its: Vec<VecIterator> = vec![
            vec_iter(&[]).at_level(2).with_priority(1),
            vec_iter(&[]).at_level(0).with_priority(2),
            vec_iter(&[]).at_level(1).with_priority(3),
            vec_iter(&[]).at_level(0).with_priority(4),
        ];
        its.sort_by(|a, b| fm.level_iterator_order(a, b));

        let order: Vec<(usize, u64)> = its.iter().map(|i| (i.level_num(), i.priority())).collect();
        assert_eq!(order, vec![(0, 2), (0, 4), (1, 3), (2, 1)]);
    }

    #[test]
    fn file_iterator_order_is_highest_priority_first() {
        let tmp = TempDir::new().unwrap();
        let fm = file_manager(tmp.path());
        let mut its = vec![
            vec_iter(&[]).with_priority(3),
            vec_iter(&[]).with_priority(9),
            vec_iter(&[]).with_priority(5),
        ];
        its.sort_by(|a, b| fm.file_iterator_order(a, b));

        let order: Vec<u64> = its.iter().map(|i| i.priority()).collect();
        assert_eq!(order, vec![9, 5, 3]);
    }

    #[test]
    fn scope_codes_resolve_both_ways() {
        let tmp = TempDir::new().unwrap();
        let fm = file_manager(tmp.path());
        assert_eq!(fm.lookup_scope("t", "c"), None);

        let code = fm.code_for("t", "c").unwrap();
        assert_eq!(fm.code_for("t", "c").unwrap(), code);
        assert_eq!(fm.lookup_scope("t", "c"), Some(code));
        assert_eq!(fm.scope_of(code), Some(("t".to_string(), "c".to_string())));
        assert_ne!(fm.code_for("t", "d").unwrap(), code);
        assert_eq!(fm.name_count(), 2);

        // A plain name has no table/column split.
        let plain = fm.name_to_code("plain").unwrap();
        assert_eq!(fm.code_to_name(plain).as_deref(), Some("plain"));
        assert_eq!(fm.scope_of(plain), None);
        assert_eq!(fm.lookup_code("plain"), Some(plain));
    }

    #[test]
    fn delete_tolerates_missing_files() {
        let tmp = TempDir::new().unwrap();
        let fm = file_manager(tmp.path());
        let path = tmp.path().join("x-dat");
        std::fs::write(&path, b"1").unwrap();
        fm.delete(&path).unwrap();
        assert!(!path.exists());
        fm.delete(&path).unwrap();
    }

    #[test]
    fn compare_delegates_to_comparator() {
        let tmp = TempDir::new().unwrap();
        let fm = file_manager(tmp.path());
        assert_eq!(
            fm.compare(&InternalKey::new(1, 9), &InternalKey::new(2, 0)),
            Ordering::Less
        );
        assert_eq!(fm.comparator().name(), fm.comparator_arc().name());
        assert_eq!(fm.store_dir(), tmp.path());
        assert_eq!(fm.max_period(), 10_000);
    }
}
