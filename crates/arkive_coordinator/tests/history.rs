//! Property tests for commit history and snapshot rollback, run against the
//! reconciler directly.

use arkive_coordinator::Reconciler;
use arkive_core::{db, Snapshot, Triple};
use arkive_testkit::{payload_strategy, triples_strategy, TestRepo};
use proptest::prelude::*;
use std::collections::HashSet;

fn reconciler(repo: &TestRepo) -> Reconciler {
    Reconciler::new(repo.payloads().clone(), repo.config.schema.clone())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn commit_history_has_one_row_per_distinct_statement(triples in triples_strategy(12)) {
        let repo = TestRepo::new();
        let txid = repo.begin_unsupervised();
        let id = repo.create(txid).unwrap();
        repo.replace_metadata(id, txid, &triples).unwrap();

        let mut cur = db::open(&repo.config.database).unwrap();
        reconciler(&repo).commit(&mut cur, txid).unwrap();

        let expected: HashSet<Triple> = triples.into_iter().collect();
        let history = repo.history(id);
        prop_assert_eq!(history.len(), expected.len());
        let written: HashSet<Triple> = history
            .into_iter()
            .map(|(property, kind, lang, value)| Triple { property, kind, lang, value })
            .collect();
        prop_assert_eq!(written, expected);
    }

    #[test]
    fn rollback_returns_to_snapshot(
        before in payload_strategy(),
        after in payload_strategy(),
        triples in triples_strategy(6),
    ) {
        let repo = TestRepo::new();
        let id = repo.seed("before", &before);
        let snapshot = Snapshot::pin(&repo.config.database).unwrap();
        let original = arkive_core::ResourceRows::load(repo.conn(), id).unwrap();

        let txid = repo.begin_unsupervised();
        repo.replace_metadata(id, txid, &triples).unwrap();
        repo.upload_payload(id, txid, &after[..]).unwrap();

        let mut cur = db::open(&repo.config.database).unwrap();
        reconciler(&repo).rollback(&mut cur, snapshot.conn(), txid).unwrap();

        prop_assert_eq!(arkive_core::ResourceRows::load(repo.conn(), id).unwrap(), original);
        let expected = if before.is_empty() { None } else { Some(before) };
        prop_assert_eq!(repo.payload(id), expected);
        prop_assert!(!repo.has_backup(id, txid));
    }
}
