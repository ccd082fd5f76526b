//! Facade behavior, run against both backends

mod common;

use common::{fixture, next, watch, BACKENDS};
use sqlport_core::{ChangeKind, Notification, StorageError, Value};

#[tokio::test(flavor = "multi_thread")]
async fn end_to_end_insert_notify_query() {
    for kind in BACKENDS {
        let fx = fixture(kind).await;
        let store = &fx.store;

        let db = store.open("t.db").await.unwrap();
        store
            .execute(db, "CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)", None)
            .await
            .unwrap();
        let (_token, mut events) = watch(store, db);

        store
            .execute(
                db,
                "INSERT INTO t VALUES (?, ?)",
                Some(vec![Value::Integer(1), Value::from("a")]),
            )
            .await
            .unwrap();

        let event = next(&mut events).await;
        let change = event.as_change().unwrap();
        assert_eq!(change.change_kind, ChangeKind::Insert);
        assert_eq!(change.table_name.as_deref(), Some("t"));
        assert_eq!(change.row_id, 1);
        common::assert_quiet(&mut events).await;

        let mut rows = store
            .query(db, "SELECT v FROM t WHERE id = ?", Some(vec![1.into()]))
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.columns(), ["v".to_string()]);
        assert_eq!(row.get("v"), Some(&Value::Text("a".to_string())));
        assert_eq!(rows.next().await.unwrap(), None);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_handle_is_reported() {
    for kind in BACKENDS {
        let fx = fixture(kind).await;
        let store = &fx.store;

        let db = store.open("stale.db").await.unwrap();
        store.close(db).await.unwrap();

        let expected = StorageError::UnknownHandle(db);
        assert_eq!(
            store.execute(db, "SELECT 1", None).await.unwrap_err(),
            expected
        );
        assert_eq!(
            store.query(db, "SELECT 1", None).await.unwrap_err(),
            expected
        );
        assert_eq!(store.on_update(db, |_| {}).unwrap_err(), expected);
        assert_eq!(store.close(db).await.unwrap_err(), expected);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_errors_carry_the_diagnostic() {
    for kind in BACKENDS {
        let fx = fixture(kind).await;
        let db = fx.store.primary().unwrap();

        let err = fx
            .store
            .execute(db, "INSERT INTO missing VALUES (1)", None)
            .await
            .unwrap_err();
        match err {
            StorageError::Engine(message) => assert!(message.contains("no such table")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn same_handle_requests_run_in_issuance_order() {
    for kind in BACKENDS {
        let fx = fixture(kind).await;
        let store = &fx.store;
        let db = store.primary().unwrap();
        store
            .execute_batch(db, "CREATE TABLE log(seq INTEGER)")
            .await
            .unwrap();

        let inserts = (0..20i64).map(|seq| {
            store.execute(db, "INSERT INTO log VALUES (?)", Some(vec![Value::Integer(seq)]))
        });
        for result in futures_util::future::join_all(inserts).await {
            result.unwrap();
        }

        let rows = store
            .query_all(db, "SELECT seq FROM log ORDER BY rowid", None)
            .await
            .unwrap();
        let seqs: Vec<i64> = rows
            .iter()
            .filter_map(|row| row.get("seq").and_then(Value::as_i64))
            .collect();
        assert_eq!(seqs, (0..20i64).collect::<Vec<_>>());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_recreates_primary_and_notifies_once() {
    for kind in BACKENDS {
        let fx = fixture(kind).await;
        let store = &fx.store;
        let old = store.primary().unwrap();
        let other = store.open("other.db").await.unwrap();

        let (_a, mut first) = watch(store, old);
        let (_b, mut second) = watch(store, old);
        let (_c, mut elsewhere) = watch(store, other);

        store
            .execute(
                old,
                "INSERT INTO accounts (public_key, name, created_at) VALUES (x'01', 'alice', 0)",
                None,
            )
            .await
            .unwrap();
        assert!(next(&mut first).await.as_change().is_some());
        assert!(next(&mut second).await.as_change().is_some());

        let new = store.reset().await.unwrap();
        assert_ne!(old, new);
        assert_eq!(store.primary().unwrap(), new);
        assert!(!store.is_open(old));

        for rx in [&mut first, &mut second, &mut elsewhere] {
            assert_eq!(next(rx).await, Notification::Reset);
            common::assert_quiet(rx).await;
        }

        let rows = store
            .query_all(new, "SELECT * FROM accounts", None)
            .await
            .unwrap();
        assert!(rows.is_empty());

        // Subscribers followed the primary to its new handle.
        assert_eq!(store.subscriber_count(new), 2);
        store
            .execute(
                new,
                "INSERT INTO accounts (public_key, name, created_at) VALUES (x'02', 'bob', 0)",
                None,
            )
            .await
            .unwrap();
        assert!(next(&mut first).await.as_change().is_some());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn changes_committed_before_reset_arrive_before_it() {
    for kind in BACKENDS {
        let fx = fixture(kind).await;
        let store = &fx.store;
        let old = store.primary().unwrap();
        let (_token, mut rx) = watch(store, old);

        for key in 1..=25u8 {
            store
                .execute(
                    old,
                    "INSERT INTO accounts (public_key, name, created_at) VALUES (?, 'peer', 0)",
                    Some(vec![Value::Blob(vec![key])]),
                )
                .await
                .unwrap();
        }
        // No waiting for the notifications before resetting.
        store.reset().await.unwrap();

        for _ in 1..=25 {
            let notification = next(&mut rx).await;
            let change = notification.as_change().unwrap();
            assert_eq!(change.table_name.as_deref(), Some("accounts"));
        }
        assert_eq!(next(&mut rx).await, Notification::Reset);
        common::assert_quiet(&mut rx).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn json_parameters_bind_like_native_values() {
    for kind in BACKENDS {
        let fx = fixture(kind).await;
        let db = fx.store.primary().unwrap();
        fx.store
            .execute_batch(db, "CREATE TABLE kv(k TEXT, n INTEGER, r REAL, b BLOB)")
            .await
            .unwrap();

        let params = sqlport_core::params_from_json(vec![
            serde_json::json!("key"),
            serde_json::json!(true),
            serde_json::json!(0.5),
            serde_json::json!([0, 255]),
        ])
        .unwrap();
        fx.store
            .execute(db, "INSERT INTO kv VALUES (?, ?, ?, ?)", Some(params))
            .await
            .unwrap();

        let rows = fx.store.query_all(db, "SELECT * FROM kv", None).await.unwrap();
        assert_eq!(
            rows[0].to_json(),
            serde_json::json!({"k": "key", "n": 1, "r": 0.5, "b": [0, 255]})
        );
    }
}
