//! `FileNameStore` persistence and torn-tail handling.

#[cfg(test)]
mod tests {
    use std::fs::{self, OpenOptions};
    use std::io::Write;

    use tempfile::TempDir;

    use crate::names::{FileNameStore, NameDictionary, NameError, NameStore};

    /// # Scenario
    /// Allocate codes, drop the dictionary, open a new one over the same log.
    ///
    /// # Expected behavior
    /// Every mapping comes back and new names continue the sequence.
    #[test]
    fn mappings_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("names.log");

        let (a, b) = {
            let dict = NameDictionary::new(Box::new(FileNameStore::new(&path)));
            dict.recover().unwrap();
            (dict.code_of("a").unwrap(), dict.code_of("b").unwrap())
        };

        let dict = NameDictionary::new(Box::new(FileNameStore::new(&path)));
        assert_eq!(dict.recover().unwrap(), 2);
        assert_eq!(dict.lookup("a"), Some(a));
        assert_eq!(dict.name_of(b).as_deref(), Some("b"));
        assert_eq!(dict.code_of("c").unwrap(), b + 1);
    }

    #[test]
    fn missing_log_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let store = FileNameStore::new(tmp.path().join("absent.log"));
        assert!(store.load().unwrap().is_empty());
    }

    /// # Scenario
    /// A crash leaves half a record at the end of the log.
    ///
    /// # Expected behavior
    /// Complete records load; the partial one is dropped.
    #[test]
    fn torn_tail_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("names.log");
        let store = FileNameStore::new(&path);
        store.persist("alpha", 1).unwrap();
        store.persist("beta", 2).unwrap();

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[20, 0, 0, 0, 1, 2]).unwrap();
        drop(f);

        let loaded = FileNameStore::new(&path).load().unwrap();
        assert_eq!(
            loaded,
            vec![("alpha".to_string(), 1), ("beta".to_string(), 2)]
        );
    }

    #[test]
    fn bad_last_checksum_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("names.log");
        let store = FileNameStore::new(&path);
        store.persist("alpha", 1).unwrap();
        store.persist("beta", 2).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let loaded = FileNameStore::new(&path).load().unwrap();
        assert_eq!(loaded, vec![("alpha".to_string(), 1)]);
    }

    /// A damaged record followed by intact ones is not a torn append.
    #[test]
    fn damage_before_tail_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("names.log");
        let store = FileNameStore::new(&path);
        store.persist("alpha", 1).unwrap();
        store.persist("beta", 2).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        // First byte of "alpha", after the code and the name length.
        bytes[8 + 4 + 4] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            FileNameStore::new(&path).load(),
            Err(NameError::Corrupt(_))
        ));
    }

    /// # Scenario
    /// An append dies partway, leaving half a record behind, and the same
    /// store then persists another name.
    ///
    /// # Expected behavior
    /// The half record is cut away before the next append, so the log
    /// reloads cleanly with both intact records.
    #[test]
    fn append_after_partial_write_replaces_torn_bytes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("names.log");
        let store = FileNameStore::new(&path);
        store.persist("alpha", 1).unwrap();
        let intact = fs::metadata(&path).unwrap().len();

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[20, 0, 0, 0, 1, 2]).unwrap();
        drop(f);

        store.persist("beta", 2).unwrap();

        let loaded = FileNameStore::new(&path).load().unwrap();
        assert_eq!(
            loaded,
            vec![("alpha".to_string(), 1), ("beta".to_string(), 2)]
        );
        assert_eq!(fs::metadata(&path).unwrap().len(), intact * 2 - 1);
    }

    /// # Scenario
    /// A crash leaves a torn tail; after restart a fresh store appends.
    ///
    /// # Expected behavior
    /// The new record follows the last intact one and every later open
    /// succeeds.
    #[test]
    fn reopened_store_appends_over_torn_tail() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("names.log");
        FileNameStore::new(&path).persist("alpha", 1).unwrap();

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[20, 0, 0, 0, 1, 2]).unwrap();
        drop(f);

        let dict = NameDictionary::new(Box::new(FileNameStore::new(&path)));
        assert_eq!(dict.recover().unwrap(), 1);
        assert_eq!(dict.code_of("beta").unwrap(), 2);
        drop(dict);

        let dict = NameDictionary::new(Box::new(FileNameStore::new(&path)));
        assert_eq!(dict.recover().unwrap(), 2);
        assert_eq!(dict.lookup("alpha"), Some(1));
        assert_eq!(dict.lookup("beta"), Some(2));
    }
}
