//! Entity-level data access on top of a session.

use crate::error::{DbError, DbResult};
use crate::models::builder::{Delete, Insert, Select, Update};
use crate::models::dialect::DatabaseType;
use crate::models::query::{QueryParam, Row};
use crate::models::table::{Entity, Table, ACTIVE_COLUMN};
use crate::session::{LookupOptions, Session};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// CRUD operations for one entity type.
///
/// Every operation runs inside the borrowed session's transaction; nothing is
/// committed here.
pub struct Repository<'s, E: Entity> {
    session: &'s mut Session,
    table: Arc<Table>,
    _entity: PhantomData<fn() -> E>,
}

impl<'s, E: Entity> Repository<'s, E> {
    pub fn new(session: &'s mut Session) -> Self {
        Self {
            session,
            table: E::table(),
            _entity: PhantomData,
        }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn session(&mut self) -> &mut Session {
        self.session
    }

    fn pk(&self) -> DbResult<&str> {
        self.table
            .primary_key()
            .map(|c| c.name.as_str())
            .ok_or_else(|| {
                DbError::invalid_input(format!("Table '{}' has no primary key", self.table.name))
            })
    }

    /// Insert one row and load the stored entity, defaults included.
    pub async fn insert(&mut self, values: &Row) -> DbResult<E> {
        let pk = self.pk()?.to_string();
        let bind = self.session.get_bind(Some(&self.table))?;
        let insert = Insert::into(self.table.clone()).row(values);

        let id = match values.get(&pk) {
            Some(id) if !id.is_null() => {
                self.session.execute_built(&insert).await?;
                QueryParam::from_json(id)
            }
            _ if bind.db_type() == DatabaseType::Postgres => {
                let rows = self.session.fetch_built(&insert.returning()).await?;
                rows.first()
                    .and_then(|row| row.get(&pk))
                    .map(QueryParam::from_json)
                    .ok_or_else(|| DbError::internal("Insert returned no primary key"))?
            }
            _ => {
                let result = self.session.execute_built(&insert).await?;
                result
                    .last_insert_id
                    .map(QueryParam::Int)
                    .ok_or_else(|| DbError::internal("Insert returned no primary key"))?
            }
        };
        debug!(table = %self.table.name, id = ?id, "Inserted row");
        self.require(id).await
    }

    pub async fn bulk_insert(&mut self, rows: &[Row]) -> DbResult<Vec<E>> {
        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            inserted.push(self.insert(row).await?);
        }
        Ok(inserted)
    }

    /// Active entity by primary key.
    pub async fn get(&mut self, id: impl Into<QueryParam>) -> DbResult<Option<E>> {
        self.session.get::<E>(id).await
    }

    pub async fn get_with(
        &mut self,
        id: impl Into<QueryParam>,
        options: &LookupOptions,
    ) -> DbResult<Option<E>> {
        self.session.get_with::<E>(id, options).await
    }

    async fn require(&mut self, id: QueryParam) -> DbResult<E> {
        let options = LookupOptions::default()
            .include_inactive()
            .description(format!("No '{}' row with id {:?}", self.table.name, id));
        self.session.get_or_404::<E>(id, &options).await
    }

    /// First active entity whose `column` equals `value`.
    pub async fn get_by(
        &mut self,
        column: &str,
        value: impl Into<QueryParam>,
    ) -> DbResult<Option<E>> {
        let select = self.query().filter_eq(column, value).limit(1);
        Ok(self.session.select_as::<E>(&select).await?.into_iter().next())
    }

    /// A select over this entity's table, ready for filters.
    pub fn query(&self) -> Select {
        Select::from(self.table.clone())
    }

    pub async fn select(&mut self, select: &Select) -> DbResult<Vec<E>> {
        self.session.select_as::<E>(select).await
    }

    /// All active entities.
    pub async fn all(&mut self) -> DbResult<Vec<E>> {
        let select = self.query();
        self.select(&select).await
    }

    /// Set columns on the entity with `id` and return it as stored.
    pub async fn update(&mut self, id: impl Into<QueryParam>, values: &Row) -> DbResult<E> {
        if values.is_empty() {
            return Err(DbError::invalid_input("Update needs at least one column"));
        }
        let id = id.into();
        let update = Update::new(self.table.clone())
            .set_row(values)
            .filter_eq(self.pk()?, id.clone());
        let result = self.session.execute_built(&update).await?;
        if result.rows_affected == 0 {
            return Err(DbError::not_found(Some(format!(
                "No '{}' row with id {:?}",
                self.table.name, id
            ))));
        }
        self.require(id).await
    }

    /// Delete the row with `id`. Returns whether a row was removed.
    pub async fn delete(&mut self, id: impl Into<QueryParam>) -> DbResult<bool> {
        let delete = Delete::from(self.table.clone()).filter_eq(self.pk()?, id);
        let result = self.session.execute_built(&delete).await?;
        Ok(result.rows_affected > 0)
    }

    /// Whether any active row matches every column in `filters`.
    pub async fn exists(&mut self, filters: &Row) -> DbResult<bool> {
        let mut select = self.query().limit(1);
        for (column, value) in filters {
            select.push_filter_eq(column.clone(), QueryParam::from_json(value));
        }
        Ok(!self.session.select(&select).await?.is_empty())
    }

    /// Soft-delete: hide the row from ordinary queries.
    pub async fn deactivate(&mut self, id: impl Into<QueryParam>) -> DbResult<E> {
        self.set_active(id.into(), false).await
    }

    /// Undo [`Repository::deactivate`].
    pub async fn reactivate(&mut self, id: impl Into<QueryParam>) -> DbResult<E> {
        self.set_active(id.into(), true).await
    }

    async fn set_active(&mut self, id: QueryParam, active: bool) -> DbResult<E> {
        if !self.table.soft_delete {
            return Err(DbError::invalid_input(format!(
                "Table '{}' does not support soft delete",
                self.table.name
            )));
        }
        let mut values = Row::new();
        values.insert(ACTIVE_COLUMN.to_string(), active.into());
        self.update(id, &values).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, BindConfig};
    use crate::db::registry::BindRegistry;
    use crate::models::table::{Column, ColumnType};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::OnceLock;
    use tempfile::NamedTempFile;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Todo {
        id: i64,
        title: String,
        is_active: bool,
    }

    impl Entity for Todo {
        fn table() -> Arc<Table> {
            static TABLE: OnceLock<Arc<Table>> = OnceLock::new();
            TABLE
                .get_or_init(|| {
                    Arc::new(
                        Table::new("todo")
                            .column(Column::id())
                            .column(Column::new("title", ColumnType::String).not_null())
                            .soft_delete(),
                    )
                })
                .clone()
        }
    }

    fn row(value: serde_json::Value) -> Row {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    async fn registry(file: &NamedTempFile) -> BindRegistry {
        let config = AppConfig::default().bind(
            "default",
            BindConfig::new(format!("sqlite:{}", file.path().display())),
        );
        let registry = BindRegistry::builder(config)
            .entity::<Todo>()
            .build()
            .await
            .unwrap();
        registry.create_all("default").await.unwrap().ensure_success().unwrap();
        registry
    }

    #[tokio::test]
    async fn test_insert_update_delete() {
        let file = NamedTempFile::new().unwrap();
        let registry = registry(&file).await;
        let mut session = registry.session().unwrap();
        let mut repo = Repository::<Todo>::new(&mut session);

        let todo = repo.insert(&row(json!({"title": "write tests"}))).await.unwrap();
        assert_eq!(todo.title, "write tests");
        assert!(todo.is_active);

        let updated = repo
            .update(todo.id, &row(json!({"title": "run tests"})))
            .await
            .unwrap();
        assert_eq!(updated.title, "run tests");
        assert!(repo.exists(&row(json!({"title": "run tests"}))).await.unwrap());

        assert!(repo.delete(todo.id).await.unwrap());
        assert!(!repo.delete(todo.id).await.unwrap());
        assert!(repo.get(todo.id).await.unwrap().is_none());
        let err = repo
            .update(todo.id, &row(json!({"title": "x"})))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        session.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_deactivate_and_reactivate() {
        let file = NamedTempFile::new().unwrap();
        let registry = registry(&file).await;
        let mut session = registry.session().unwrap();
        let mut repo = Repository::<Todo>::new(&mut session);

        let todos = repo
            .bulk_insert(&[row(json!({"title": "a"})), row(json!({"title": "b"}))])
            .await
            .unwrap();
        let hidden = repo.deactivate(todos[0].id).await.unwrap();
        assert!(!hidden.is_active);
        assert!(repo.get(todos[0].id).await.unwrap().is_none());
        assert_eq!(repo.all().await.unwrap(), vec![todos[1].clone()]);

        let restored = repo.reactivate(todos[0].id).await.unwrap();
        assert!(restored.is_active);
        assert_eq!(repo.get(todos[0].id).await.unwrap(), Some(restored));
        session.rollback().await.unwrap();
    }
}
