//! Request scope middleware and the session extractor.

use crate::error::DbError;
use crate::session::{ScopedSession, ScopedSessionManager};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use std::ops::Deref;

/// Run the rest of the request in a fresh session scope.
///
/// The scope's session is closed once the response is produced, or in the
/// background if the request future is dropped first.
pub(super) async fn session_scope(
    State(sessions): State<ScopedSessionManager>,
    mut request: Request,
    next: Next,
) -> Response {
    request.extensions_mut().insert(sessions.clone());
    sessions.scope(next.run(request)).await
}

/// The current request's scoped session.
///
/// Rejected with `NoActiveScope` when the router was not set up through
/// [`Database::init_router`](super::Database::init_router).
pub struct DbSession(pub ScopedSession);

impl Deref for DbSession {
    type Target = ScopedSession;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S> FromRequestParts<S> for DbSession
where
    S: Send + Sync,
{
    type Rejection = DbError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let sessions = parts
            .extensions
            .get::<ScopedSessionManager>()
            .ok_or(DbError::NoActiveScope)?;
        Ok(Self(sessions.current()?))
    }
}
