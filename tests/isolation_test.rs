//! Integration tests for scoped sessions, test transactions and bind contexts.

use futures_util::FutureExt;
use sqlx_binds::config::{AppConfig, BindConfig};
use sqlx_binds::db::{Bind, BindRegistry, ExecutionOptions};
use sqlx_binds::error::DbError;
use sqlx_binds::models::{IsolationLevel, Statement};
use sqlx_binds::session::Session;
use sqlx_binds::testing::TestTransaction;
use std::sync::Arc;
use tempfile::NamedTempFile;

async fn registry(file: &NamedTempFile) -> BindRegistry {
    let config = AppConfig::default().bind(
        "default",
        BindConfig::new(format!("sqlite:{}", file.path().display())),
    );
    let registry = BindRegistry::from_config(config).await.unwrap();
    let mut session = registry.session().unwrap();
    session
        .execute("CREATE TABLE todo (id INTEGER PRIMARY KEY, name TEXT)")
        .await
        .unwrap();
    session.commit().await.unwrap();
    registry
}

async fn count(bind: &Bind) -> i64 {
    let mut session = bind.session().unwrap();
    let n = session
        .scalars("SELECT COUNT(*) FROM todo")
        .await
        .unwrap()
        .one()
        .unwrap();
    session.close().await.unwrap();
    n
}

async fn insert(session: &mut Session, name: &str) -> Result<(), DbError> {
    session
        .execute(Statement::new("INSERT INTO todo (name) VALUES (?)").bind(name))
        .await
        .map(|_| ())
}

#[tokio::test]
async fn test_scoped_session_identity() {
    let file = NamedTempFile::new().unwrap();
    let registry = registry(&file).await;
    let manager = registry.scoped_session().unwrap();

    let first = manager
        .scope(async {
            let a = manager.current().unwrap();
            let b = manager.current().unwrap();
            assert!(Arc::ptr_eq(&a, &b));
            insert(&mut *a.lock().await, "scoped").await.unwrap();
            a
        })
        .await;
    // Teardown closed the session without committing
    assert!(!first.lock().await.in_transaction());
    assert_eq!(count(&registry.default_bind().unwrap()).await, 0);

    let second = manager.scope(async { manager.current().unwrap() }).await;
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(matches!(manager.current(), Err(DbError::NoActiveScope)));
}

#[tokio::test]
async fn test_concurrent_scopes_are_independent() {
    let file = NamedTempFile::new().unwrap();
    let registry = registry(&file).await;
    let manager = registry.scoped_session().unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            let inner = manager.clone();
            manager
                .scope(async move {
                    let session = inner.current().unwrap();
                    tokio::task::yield_now().await;
                    assert!(Arc::ptr_eq(&session, &inner.current().unwrap()));
                    Arc::as_ptr(&session) as usize
                })
                .await
        }));
    }
    let mut seen = Vec::new();
    for handle in handles {
        seen.push(handle.await.unwrap());
    }
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 4);
    assert_eq!(manager.active_scopes(), 0);
}

#[tokio::test]
async fn test_test_transaction_discards_commits() {
    let file = NamedTempFile::new().unwrap();
    let registry = registry(&file).await;
    let bind = registry.default_bind().unwrap();

    for savepoint in [false, true] {
        let txn = bind.test_transaction(savepoint).await.unwrap();
        let mut session = txn.session().unwrap();
        for i in 0..3 {
            insert(&mut session, &format!("row {i}")).await.unwrap();
            session.commit().await.unwrap();
        }
        let inside: i64 = session
            .scalars("SELECT COUNT(*) FROM todo")
            .await
            .unwrap()
            .one()
            .unwrap();
        assert_eq!(inside, 3);
        drop(session);
        txn.close(None).await.unwrap();

        assert_eq!(count(&bind).await, 0, "savepoint = {savepoint}");
    }
}

#[tokio::test]
async fn test_test_transaction_survives_inner_rollback() {
    let file = NamedTempFile::new().unwrap();
    let registry = registry(&file).await;
    let bind = registry.default_bind().unwrap();

    for savepoint in [false, true] {
        let txn = bind.test_transaction(savepoint).await.unwrap();
        let mut session = txn.session().unwrap();
        insert(&mut session, "first").await.unwrap();
        session.rollback().await.unwrap();
        insert(&mut session, "second").await.unwrap();
        session.commit().await.unwrap();
        insert(&mut session, "third").await.unwrap();
        session.close().await.unwrap();
        insert(&mut session, "fourth").await.unwrap();
        session.commit().await.unwrap();

        let names: Vec<String> = session
            .scalars("SELECT name FROM todo ORDER BY id")
            .await
            .unwrap()
            .all();
        // A joined session's rollback restarts the whole outer transaction
        let expected = if savepoint {
            vec!["second", "fourth"]
        } else {
            vec!["fourth"]
        };
        assert_eq!(names, expected, "savepoint = {savepoint}");
        drop(session);
        txn.close(None).await.unwrap();

        assert_eq!(count(&bind).await, 0, "savepoint = {savepoint}");
    }
}

#[tokio::test]
async fn test_test_transaction_interleaved_sessions() {
    let file = NamedTempFile::new().unwrap();
    let registry = registry(&file).await;
    let bind = registry.default_bind().unwrap();

    for savepoint in [false, true] {
        let txn = bind.test_transaction(savepoint).await.unwrap();
        let mut first = txn.session().unwrap();
        let mut second = txn.session().unwrap();

        insert(&mut first, "a1").await.unwrap();
        insert(&mut second, "b1").await.unwrap();
        first.commit().await.unwrap();
        insert(&mut second, "b2").await.unwrap();
        second.commit().await.unwrap();
        insert(&mut first, "a2").await.unwrap();
        insert(&mut second, "b3").await.unwrap();
        second.commit().await.unwrap();
        first.commit().await.unwrap();

        let inside: i64 = first
            .scalars("SELECT COUNT(*) FROM todo")
            .await
            .unwrap()
            .one()
            .unwrap();
        assert_eq!(inside, 5, "savepoint = {savepoint}");
        first.close().await.unwrap();
        drop(first);
        drop(second);
        txn.close(None).await.unwrap();

        assert_eq!(count(&bind).await, 0, "savepoint = {savepoint}");
    }
}

#[tokio::test]
async fn test_test_transaction_reraises_after_savepoint_commit() {
    let file = NamedTempFile::new().unwrap();
    let registry = registry(&file).await;
    let bind = registry.default_bind().unwrap();

    let err = TestTransaction::run(&bind, true, |s| {
        async move {
            insert(s, "doomed").await?;
            s.commit().await?;
            Err::<(), _>(DbError::invalid_input("raised inside the block"))
        }
        .boxed()
    })
    .await
    .unwrap_err();

    match err {
        DbError::InvalidInput { message } => assert_eq!(message, "raised inside the block"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(count(&bind).await, 0);
}

#[tokio::test]
async fn test_test_transaction_scoped_sessions() {
    let file = NamedTempFile::new().unwrap();
    let registry = registry(&file).await;
    let bind = registry.default_bind().unwrap();

    let txn = bind.test_transaction(true).await.unwrap();
    let manager = txn.scoped_session().unwrap();
    manager
        .scope(async {
            let session = manager.current().unwrap();
            let mut session = session.lock().await;
            insert(&mut session, "scoped").await.unwrap();
            session.commit().await.unwrap();
        })
        .await;
    drop(manager);
    txn.close(None).await.unwrap();
    assert_eq!(count(&bind).await, 0);
}

#[tokio::test]
async fn test_bind_context_restores_engine() {
    let file = NamedTempFile::new().unwrap();
    let registry = registry(&file).await;
    let bind = registry.default_bind().unwrap();
    let options = ExecutionOptions {
        isolation_level: Some(IsolationLevel::ReadUncommitted),
    };

    let mut ctx = bind.context(options).unwrap();
    let session = ctx.enter().await.unwrap();
    insert(session, "in context").await.unwrap();
    let level: i64 = session
        .scalars("PRAGMA read_uncommitted")
        .await
        .unwrap()
        .one()
        .unwrap();
    assert_eq!(level, 1);
    ctx.exit(false).await.unwrap();

    assert!(!bind.engine().unwrap().is_disposed());
    assert_eq!(count(&bind).await, 1);

    // Unrelated sessions are back on the bind's own settings
    for _ in 0..3 {
        let mut session = registry.session().unwrap();
        let level: i64 = session
            .scalars("PRAGMA read_uncommitted")
            .await
            .unwrap()
            .one()
            .unwrap();
        assert_eq!(level, 0);
        session.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_bind_context_failure_rolls_back() {
    let file = NamedTempFile::new().unwrap();
    let registry = registry(&file).await;
    let bind = registry.default_bind().unwrap();

    let err = bind
        .context(ExecutionOptions::default())
        .unwrap()
        .run(|s| {
            async move {
                insert(s, "lost").await?;
                Err::<(), _>(DbError::invalid_input("boom"))
            }
            .boxed()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
    assert_eq!(count(&bind).await, 0);
}

#[tokio::test]
async fn test_uninitialized_bind_fails_fast() {
    let bind = Bind::new("default", BindConfig::new("sqlite::memory:")).unwrap();
    assert!(matches!(bind.session(), Err(DbError::NotInitialized { .. })));
    assert!(matches!(
        bind.context(ExecutionOptions::default()),
        Err(DbError::NotInitialized { .. })
    ));
    assert!(matches!(
        bind.test_transaction(false).await,
        Err(DbError::NotInitialized { .. })
    ));
}
