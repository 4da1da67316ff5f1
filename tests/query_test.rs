//! Integration tests for query helpers, pagination and repositories.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx_binds::config::{AppConfig, BindConfig};
use sqlx_binds::db::BindRegistry;
use sqlx_binds::error::DbError;
use sqlx_binds::models::{Column, ColumnType, Entity, Row, Select, Table};
use sqlx_binds::repository::Repository;
use sqlx_binds::session::{LookupOptions, PageRequest};
use std::sync::{Arc, OnceLock};
use tempfile::NamedTempFile;
use tokio_test::{assert_err, assert_ok};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Item {
    id: i64,
    name: String,
    is_active: bool,
}

impl Entity for Item {
    fn table() -> Arc<Table> {
        static TABLE: OnceLock<Arc<Table>> = OnceLock::new();
        TABLE
            .get_or_init(|| {
                Arc::new(
                    Table::new("items")
                        .column(Column::id())
                        .column(Column::new("name", ColumnType::String).not_null())
                        .soft_delete(),
                )
            })
            .clone()
    }
}

fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().unwrap_or_default()
}

async fn seeded(file: &NamedTempFile, n: usize) -> BindRegistry {
    let config = AppConfig::default()
        .bind(
            "default",
            BindConfig::new(format!("sqlite:{}", file.path().display())),
        )
        .record_queries(true);
    let registry = BindRegistry::builder(config)
        .entity::<Item>()
        .build()
        .await
        .unwrap();
    registry.create_all("default").await.unwrap().ensure_success().unwrap();

    let mut session = registry.session().unwrap();
    let mut repo = Repository::<Item>::new(&mut session);
    let rows: Vec<Row> = (1..=n).map(|i| row(json!({ "name": format!("item {i:03}") }))).collect();
    repo.bulk_insert(&rows).await.unwrap();
    session.commit().await.unwrap();
    registry
}

#[tokio::test]
async fn test_paginate() {
    let file = NamedTempFile::new().unwrap();
    let registry = seeded(&file, 45).await;
    let mut session = registry.session().unwrap();
    let select = Select::from(Item::table()).order_by("id");

    let page = session
        .paginate::<Item>(&select, &PageRequest::from_query("page=2&per_page=20"))
        .await
        .unwrap();
    assert_eq!(page.total, Some(45));
    assert_eq!(page.pages(), 3);
    assert_eq!(page.items.len(), 20);
    assert_eq!(page.items[0].name, "item 021");
    assert_eq!((page.first(), page.last()), (21, 40));
    assert_eq!((page.prev_num(), page.next_num()), (Some(1), Some(3)));

    let last = session
        .paginate::<Item>(&select, &PageRequest::new().page(3).per_page(20))
        .await
        .unwrap();
    assert_eq!(last.items.len(), 5);
    assert!(!last.has_next());

    let err = session
        .paginate::<Item>(&select, &PageRequest::new().page(9))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let empty = session
        .paginate::<Item>(&select, &PageRequest::new().page(9).error_out(false).count(false))
        .await
        .unwrap();
    assert!(empty.items.is_empty());
    assert_eq!(empty.total, None);

    let huge = format!("page={}&per_page=100", i64::MAX);
    let err = session
        .paginate::<Item>(&select, &PageRequest::from_query(&huge))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    let beyond = session
        .paginate::<Item>(&select, &PageRequest::from_query(&huge).error_out(false))
        .await
        .unwrap();
    assert!(beyond.items.is_empty());
    assert_eq!(beyond.total, Some(45));
    assert!(!beyond.has_next());
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_or_404_helpers() {
    let file = NamedTempFile::new().unwrap();
    let registry = seeded(&file, 3).await;
    let mut session = registry.session().unwrap();

    let item: Item = session.get_or_404(1, &LookupOptions::default()).await.unwrap();
    assert_eq!(item.name, "item 001");

    let err = session
        .get_or_404::<Item>(99, &LookupOptions::default().description("no item 99"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Not found: no item 99");

    let all = Select::from(Item::table());
    let first: Item = session.first_or_404(&all, None).await.unwrap();
    assert_eq!(first.id, 1);

    // Zero rows and several rows are the same not-found outcome
    let none = all.clone().filter_eq("name", "missing");
    for select in [&none, &all] {
        let err = session.one_or_404::<Item>(select, None).await.unwrap_err();
        assert!(err.is_not_found());
    }
    let one: Item = session
        .one_or_404(&all.clone().filter_eq("id", 2), None)
        .await
        .unwrap();
    assert_eq!(one.id, 2);

    assert!(matches!(
        session.scalars::<i64>("SELECT id FROM items").await.unwrap().one(),
        Err(DbError::MultipleResultsFound { count: 3 })
    ));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_soft_delete_is_filtered() {
    let file = NamedTempFile::new().unwrap();
    let registry = seeded(&file, 3).await;
    let mut session = registry.session().unwrap();

    let mut repo = Repository::<Item>::new(&mut session);
    let hidden = repo.deactivate(2).await.unwrap();
    assert!(!hidden.is_active);
    assert_eq!(repo.all().await.unwrap().len(), 2);
    assert!(repo.get(2).await.unwrap().is_none());
    let found = repo
        .get_with(2, &LookupOptions::default().include_inactive())
        .await
        .unwrap();
    assert_eq!(found.map(|i| i.id), Some(2));

    assert!(repo.reactivate(2).await.unwrap().is_active);
    assert_eq!(repo.all().await.unwrap().len(), 3);
    session.rollback().await.unwrap();

    let count = session.count(&Select::from(Item::table())).await.unwrap();
    assert_eq!(count, 3);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_soft_delete_requires_flag() {
    #[derive(Debug, Serialize, Deserialize)]
    struct Plain {
        id: i64,
    }

    impl Entity for Plain {
        fn table() -> Arc<Table> {
            static TABLE: OnceLock<Arc<Table>> = OnceLock::new();
            TABLE
                .get_or_init(|| Arc::new(Table::new("plain").column(Column::id())))
                .clone()
        }
    }

    let registry = BindRegistry::builder(AppConfig::default())
        .entity::<Plain>()
        .build()
        .await
        .unwrap();
    let mut session = registry.session().unwrap();
    let err = Repository::<Plain>::new(&mut session)
        .deactivate(1)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
}

#[tokio::test]
async fn test_queries_are_recorded() {
    let file = NamedTempFile::new().unwrap();
    let registry = seeded(&file, 2).await;
    registry.clear_recorded_queries();

    let mut session = registry.session().unwrap();
    let _ = session.select(&Select::from(Item::table())).await.unwrap();
    session.close().await.unwrap();

    let queries = registry.recorded_queries();
    assert!(
        queries
            .iter()
            .any(|q| q.statement.starts_with("SELECT * FROM \"items\"") && q.bind == "default")
    );
}

#[tokio::test]
async fn test_autobegin_disabled_requires_begin() {
    let file = NamedTempFile::new().unwrap();
    let mut options = sqlx_binds::config::SessionOptions::default();
    options.autobegin = false;
    let config = AppConfig::default().bind(
        "default",
        BindConfig::new(format!("sqlite:{}", file.path().display())).session_options(options),
    );
    let registry = BindRegistry::from_config(config).await.unwrap();
    let mut session = registry.default_bind().unwrap().session().unwrap();

    let err = session.execute("SELECT 1").await.unwrap_err();
    assert!(matches!(err, DbError::InvalidRequest { .. }));

    assert_ok!(session.begin());
    assert_err!(session.begin());
    assert_ok!(session.execute("SELECT 1").await);
    assert_ok!(session.commit().await);
}
