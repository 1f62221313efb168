use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::db::check_collection_name;
use crate::error::{AppError, AppResult};
use crate::middleware::request_id::RequestId;
use crate::models::{
    parse_id, Collections, MovieBulkEntry, MovieDocument, MovieId, MoviePreselection,
    ReindexRequest, UserBulkEntry, UserDocument, UserId, UserPreselection,
};

use super::AppState;

/// Optional collection overrides accepted by every document route
#[derive(Debug, Default, Deserialize)]
pub struct CollectionParams {
    pub user_index: Option<String>,
    pub movie_index: Option<String>,
}

impl CollectionParams {
    fn resolve(self, defaults: &Collections) -> AppResult<Collections> {
        let collections = Collections::new(
            self.user_index.unwrap_or_else(|| defaults.users.clone()),
            self.movie_index.unwrap_or_else(|| defaults.movies.clone()),
        );
        check_collection_name(&collections.users)?;
        check_collection_name(&collections.movies)?;
        Ok(collections)
    }
}

/// Unwraps a JSON body, reporting a malformed payload as invalid input
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AppError::InvalidInput(rejection.body_text()))
}

const OK: &str = "Ok";

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({ "status": "healthy", "store": state.store.name() })),
    )
}

// Documents

pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<CollectionParams>,
) -> AppResult<Json<UserDocument>> {
    let id: UserId = parse_id(&id)?;
    let collections = params.resolve(&state.defaults)?;
    let doc = state.relations.get_user(id, &collections.users).await?;
    Ok(Json(doc))
}

pub async fn get_movie(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<CollectionParams>,
) -> AppResult<Json<MovieDocument>> {
    let id: MovieId = parse_id(&id)?;
    let collections = params.resolve(&state.defaults)?;
    let doc = state.relations.get_movie(id, &collections.movies).await?;
    Ok(Json(doc))
}

pub async fn add_user(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
    Query(params): Query<CollectionParams>,
    payload: Result<Json<Vec<MovieId>>, JsonRejection>,
) -> AppResult<&'static str> {
    let id: UserId = parse_id(&id)?;
    let liked_movies = body(payload)?;
    let collections = params.resolve(&state.defaults)?;

    tracing::info!(request_id = %request_id, user_id = id, movies = liked_movies.len(), "Adding user");
    state
        .relations
        .add_user(id, liked_movies, &collections)
        .await?;
    Ok(OK)
}

pub async fn add_movie(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
    Query(params): Query<CollectionParams>,
    payload: Result<Json<Vec<UserId>>, JsonRejection>,
) -> AppResult<&'static str> {
    let id: MovieId = parse_id(&id)?;
    let who_liked = body(payload)?;
    let collections = params.resolve(&state.defaults)?;

    tracing::info!(request_id = %request_id, movie_id = id, users = who_liked.len(), "Adding movie");
    state.relations.add_movie(id, who_liked, &collections).await?;
    Ok(OK)
}

pub async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<CollectionParams>,
    payload: Result<Json<Vec<MovieId>>, JsonRejection>,
) -> AppResult<&'static str> {
    let id: UserId = parse_id(&id)?;
    let liked_movies = body(payload)?;
    let collections = params.resolve(&state.defaults)?;

    state
        .relations
        .update_user(id, liked_movies, &collections.users)
        .await?;
    Ok(OK)
}

pub async fn update_movie(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<CollectionParams>,
    payload: Result<Json<Vec<UserId>>, JsonRejection>,
) -> AppResult<&'static str> {
    let id: MovieId = parse_id(&id)?;
    let who_liked = body(payload)?;
    let collections = params.resolve(&state.defaults)?;

    state
        .relations
        .update_movie(id, who_liked, &collections.movies)
        .await?;
    Ok(OK)
}

pub async fn delete_user(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
    Query(params): Query<CollectionParams>,
) -> AppResult<&'static str> {
    let id: UserId = parse_id(&id)?;
    let collections = params.resolve(&state.defaults)?;

    tracing::info!(request_id = %request_id, user_id = id, "Deleting user");
    state.relations.delete_user(id, &collections).await?;
    Ok(OK)
}

pub async fn delete_movie(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
    Query(params): Query<CollectionParams>,
) -> AppResult<&'static str> {
    let id: MovieId = parse_id(&id)?;
    let collections = params.resolve(&state.defaults)?;

    tracing::info!(request_id = %request_id, movie_id = id, "Deleting movie");
    state.relations.delete_movie(id, &collections).await?;
    Ok(OK)
}

// Bulk

pub async fn bulk_update_users(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Query(params): Query<CollectionParams>,
    payload: Result<Json<Vec<UserBulkEntry>>, JsonRejection>,
) -> AppResult<&'static str> {
    let entries: Vec<(UserId, Vec<MovieId>)> =
        body(payload)?.into_iter().map(Into::into).collect();
    let collections = params.resolve(&state.defaults)?;

    tracing::info!(request_id = %request_id, entries = entries.len(), "Bulk user update");
    state
        .relations
        .bulk_update_users(entries, &collections)
        .await?;
    Ok(OK)
}

pub async fn bulk_update_movies(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Query(params): Query<CollectionParams>,
    payload: Result<Json<Vec<MovieBulkEntry>>, JsonRejection>,
) -> AppResult<&'static str> {
    let entries: Vec<(MovieId, Vec<UserId>)> =
        body(payload)?.into_iter().map(Into::into).collect();
    let collections = params.resolve(&state.defaults)?;

    tracing::info!(request_id = %request_id, entries = entries.len(), "Bulk movie update");
    state
        .relations
        .bulk_update_movies(entries, &collections)
        .await?;
    Ok(OK)
}

// Preselection

pub async fn preselect_for_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<CollectionParams>,
) -> AppResult<Json<UserPreselection>> {
    let id: UserId = parse_id(&id)?;
    let collections = params.resolve(&state.defaults)?;
    let found = state
        .preselection
        .preselect_for_user(id, &collections.users)
        .await?;
    Ok(Json(UserPreselection {
        movies_found: found.into_iter().collect(),
    }))
}

pub async fn preselect_for_movie(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<CollectionParams>,
) -> AppResult<Json<MoviePreselection>> {
    let id: MovieId = parse_id(&id)?;
    let collections = params.resolve(&state.defaults)?;
    let found = state
        .preselection
        .preselect_for_movie(id, &collections.movies)
        .await?;
    Ok(Json(MoviePreselection {
        users_found: found.into_iter().collect(),
    }))
}

// Collections

pub async fn create_index(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<&'static str> {
    check_collection_name(&name)?;
    state.store.create_collection(&name).await?;
    Ok(OK)
}

pub async fn get_indexes(State(state): State<AppState>) -> AppResult<Json<Vec<String>>> {
    Ok(Json(state.store.list_collections().await?))
}

pub async fn reindex(
    State(state): State<AppState>,
    payload: Result<Json<ReindexRequest>, JsonRejection>,
) -> AppResult<&'static str> {
    let request = body(payload)?;
    check_collection_name(&request.source)?;
    check_collection_name(&request.dest)?;
    state.store.reindex(&request.source, &request.dest).await?;
    Ok(OK)
}

pub async fn delete_index(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<&'static str> {
    check_collection_name(&name)?;
    state.store.delete_collection(&name).await?;
    Ok(OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_params_fall_back_to_defaults() {
        let defaults = Collections::default();
        let params = CollectionParams {
            user_index: Some("users_v2".to_string()),
            movie_index: None,
        };
        assert_eq!(
            params.resolve(&defaults).unwrap(),
            Collections::new("users_v2", "movies")
        );
        assert_eq!(CollectionParams::default().resolve(&defaults).unwrap(), defaults);
    }

    #[test]
    fn test_collection_params_reject_empty_and_unsafe_names() {
        let defaults = Collections::default();
        let empty = CollectionParams {
            user_index: Some(String::new()),
            movie_index: None,
        };
        assert!(matches!(
            empty.resolve(&defaults),
            Err(AppError::InvalidInput(_))
        ));

        let globbed = CollectionParams {
            user_index: None,
            movie_index: Some("movies*".to_string()),
        };
        assert!(matches!(
            globbed.resolve(&defaults),
            Err(AppError::InvalidInput(_))
        ));
    }
}
