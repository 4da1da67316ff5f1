//! axum integration: one scoped session per request.
//!
//! ```no_run
//! # async fn demo() -> sqlx_binds::DbResult<()> {
//! use axum::{Router, routing::get};
//! use sqlx_binds::{AppConfig, framework::{Database, DbSession}};
//!
//! async fn handler(DbSession(session): DbSession) -> String {
//!     let mut session = session.lock().await;
//!     let n: i64 = match session.scalars("SELECT 1").await.and_then(|r| r.one()) {
//!         Ok(n) => n,
//!         Err(e) => return e.to_string(),
//!     };
//!     n.to_string()
//! }
//!
//! let db = Database::from_config(AppConfig::default()).await?;
//! let app: Router = db.init_router(Router::new().route("/", get(handler)))?;
//! # Ok(())
//! # }
//! ```

mod middleware;
mod response;

pub use middleware::DbSession;

use crate::config::AppConfig;
use crate::db::registry::BindRegistry;
use crate::error::{DbError, DbResult};
use crate::session::ScopedSessionManager;
use axum::Router;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// The database extension for an axum application.
#[derive(Debug, Clone)]
pub struct Database {
    registry: BindRegistry,
    sessions: ScopedSessionManager,
    installed: Arc<AtomicBool>,
}

impl Database {
    pub async fn from_config(config: AppConfig) -> DbResult<Self> {
        Self::new(BindRegistry::from_config(config).await?)
    }

    pub fn new(registry: BindRegistry) -> DbResult<Self> {
        let sessions = registry.scoped_session()?;
        Ok(Self {
            registry,
            sessions,
            installed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn registry(&self) -> &BindRegistry {
        &self.registry
    }

    /// The request-scoped session manager.
    pub fn sessions(&self) -> &ScopedSessionManager {
        &self.sessions
    }

    /// Install the per-request session scope on `router`.
    ///
    /// Allowed once per `Database`; a second call is a configuration error.
    pub fn init_router<S>(&self, router: Router<S>) -> DbResult<Router<S>>
    where
        S: Clone + Send + Sync + 'static,
    {
        if self
            .installed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DbError::configuration(
                "Database is already installed on a router",
            ));
        }

        let binds: Vec<String> = self.registry.bind_names().into_iter().map(String::from).collect();
        let signals = self.registry.signals();
        signals.emit(|o| o.before_framework_init(&binds));
        let router = router.layer(axum::middleware::from_fn_with_state(
            self.sessions.clone(),
            middleware::session_scope,
        ));
        signals.emit(|o| o.after_framework_init(&binds));
        info!(binds = ?binds, "Database installed on router");
        Ok(router)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use tower::ServiceExt;

    async fn scalar(DbSession(session): DbSession) -> Result<String, DbError> {
        let mut session = session.lock().await;
        let n: i64 = session.scalars("SELECT 41 + 1").await?.one()?;
        Ok(n.to_string())
    }

    async fn missing() -> Result<String, DbError> {
        Err(DbError::not_found(Some("no such thing")))
    }

    #[tokio::test]
    async fn test_request_scope() {
        let db = Database::from_config(AppConfig::default()).await.unwrap();
        let app = db
            .init_router(Router::new().route("/", get(scalar)).route("/missing", get(missing)))
            .unwrap();

        let response = app
            .clone()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"42");
        assert_eq!(db.sessions().active_scopes(), 0);

        let response = app
            .oneshot(Request::get("/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_init_router_once() {
        let db = Database::from_config(AppConfig::default()).await.unwrap();
        db.init_router::<()>(Router::new()).unwrap();
        let err = db.init_router::<()>(Router::new()).unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_extractor_without_middleware() {
        let app: Router = Router::new().route("/", get(scalar));
        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
