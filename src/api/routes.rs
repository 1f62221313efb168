use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;
use super::AppState;
use crate::middleware::request_id::{make_span_with_request_id, request_id_middleware};

/// Creates the main API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        // Documents
        .route(
            "/user/document/:id",
            get(handlers::get_user)
                .put(handlers::add_user)
                .post(handlers::update_user)
                .delete(handlers::delete_user),
        )
        .route(
            "/movie/document/:id",
            get(handlers::get_movie)
                .put(handlers::add_movie)
                .post(handlers::update_movie)
                .delete(handlers::delete_movie),
        )
        // Preselection
        .route("/user/preselection/:id", get(handlers::preselect_for_user))
        .route("/movie/preselection/:id", get(handlers::preselect_for_movie))
        // Bulk
        .route("/user/bulk", post(handlers::bulk_update_users))
        .route("/movie/bulk", post(handlers::bulk_update_movies))
        // Collections
        .route("/indices", get(handlers::get_indexes))
        .route(
            "/indices/:name",
            put(handlers::create_index).delete(handlers::delete_index),
        )
        .route("/reindex", post(handlers::reindex))
        .layer(TraceLayer::new_for_http().make_span_with(make_span_with_request_id))
        .layer(CorsLayer::permissive())
        // added last so it runs first and the trace span can read the id
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::REQUEST_ID_HEADER;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_router_tags_every_response_with_request_id() {
        let app = create_router(AppState::in_memory());

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));

        // error responses pass through the same stack
        let response = app
            .oneshot(
                Request::get("/user/document/1")
                    .header(REQUEST_ID_HEADER, "req-7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-7");
    }
}
