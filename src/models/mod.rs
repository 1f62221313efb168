use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Display;

use crate::error::{AppError, AppResult};

pub type UserId = i64;
pub type MovieId = i64;

/// The two sides of the "liked" relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Movie,
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::User => write!(f, "user"),
            EntityKind::Movie => write!(f, "movie"),
        }
    }
}

/// A document holding one side of the relation as an adjacency list.
///
/// Each kind names its inverse, so code written once against `E` and
/// `E::Inverse` covers both directions with the roles swapped.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// The kind whose ids this document lists
    type Inverse: Entity;

    const KIND: EntityKind;

    /// Name of the adjacency field in the stored document
    const FIELD: &'static str;

    fn from_related(related: Vec<i64>) -> Self;

    fn related(&self) -> &[i64];

    fn related_mut(&mut self) -> &mut Vec<i64>;

    /// Decodes stored fields, rejecting documents without a well-formed adjacency field
    fn from_fields(id: i64, fields: &Map<String, Value>) -> AppResult<Self> {
        serde_json::from_value(Value::Object(fields.clone())).map_err(|e| {
            AppError::InvalidDocument(format!("{} {}: {}", Self::KIND, id, e))
        })
    }

    fn to_fields(&self) -> AppResult<Map<String, Value>> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(AppError::Internal(format!(
                "{} document serialized to non-object {}",
                Self::KIND,
                other
            ))),
            Err(e) => Err(AppError::Internal(format!(
                "{} document serialization error: {}",
                Self::KIND,
                e
            ))),
        }
    }
}

/// Movies a user liked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDocument {
    pub liked_movies: Vec<MovieId>,
}

/// Users who liked a movie
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieDocument {
    pub who_liked: Vec<UserId>,
}

impl Entity for UserDocument {
    type Inverse = MovieDocument;

    const KIND: EntityKind = EntityKind::User;
    const FIELD: &'static str = "likedMovies";

    fn from_related(related: Vec<i64>) -> Self {
        Self {
            liked_movies: related,
        }
    }

    fn related(&self) -> &[i64] {
        &self.liked_movies
    }

    fn related_mut(&mut self) -> &mut Vec<i64> {
        &mut self.liked_movies
    }
}

impl Entity for MovieDocument {
    type Inverse = UserDocument;

    const KIND: EntityKind = EntityKind::Movie;
    const FIELD: &'static str = "whoLiked";

    fn from_related(related: Vec<i64>) -> Self {
        Self { who_liked: related }
    }

    fn related(&self) -> &[i64] {
        &self.who_liked
    }

    fn related_mut(&mut self) -> &mut Vec<i64> {
        &mut self.who_liked
    }
}

/// User and movie collection names targeted by one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collections {
    pub users: String,
    pub movies: String,
}

impl Collections {
    pub fn new(users: impl Into<String>, movies: impl Into<String>) -> Self {
        Self {
            users: users.into(),
            movies: movies.into(),
        }
    }

    /// Collection holding documents of the given kind
    pub fn of(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::User => &self.users,
            EntityKind::Movie => &self.movies,
        }
    }
}

impl Default for Collections {
    fn default() -> Self {
        Self::new("users", "movies")
    }
}

/// One entry of a bulk user update
#[derive(Debug, Clone, Deserialize)]
pub struct UserBulkEntry {
    #[serde(alias = "user_id")]
    pub id: UserId,
    #[serde(rename = "likedMovies", alias = "liked_movies")]
    pub liked_movies: Vec<MovieId>,
}

/// One entry of a bulk movie update
#[derive(Debug, Clone, Deserialize)]
pub struct MovieBulkEntry {
    #[serde(alias = "movie_id")]
    pub id: MovieId,
    #[serde(rename = "whoLiked", alias = "users_who_liked_movie")]
    pub who_liked: Vec<UserId>,
}

impl From<UserBulkEntry> for (UserId, Vec<MovieId>) {
    fn from(entry: UserBulkEntry) -> Self {
        (entry.id, entry.liked_movies)
    }
}

impl From<MovieBulkEntry> for (MovieId, Vec<UserId>) {
    fn from(entry: MovieBulkEntry) -> Self {
        (entry.id, entry.who_liked)
    }
}

/// Candidate movies for a user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreselection {
    pub movies_found: Vec<MovieId>,
}

/// Candidate users for a movie
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoviePreselection {
    pub users_found: Vec<UserId>,
}

/// Request to copy every document of one collection into another
#[derive(Debug, Clone, Deserialize)]
pub struct ReindexRequest {
    pub source: String,
    pub dest: String,
}

/// Parses an entity id taken from a path segment
pub fn parse_id(raw: &str) -> AppResult<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| AppError::InvalidInput(format!("'{}' is not an integer id", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_user_document_field_name() {
        let doc = UserDocument::from_related(vec![1, 2]);
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json, json!({"likedMovies": [1, 2]}));
    }

    #[test]
    fn test_movie_document_field_name() {
        let doc = MovieDocument::from_related(vec![7]);
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json, json!({"whoLiked": [7]}));
    }

    #[test]
    fn test_from_fields_rejects_missing_field() {
        let result = UserDocument::from_fields(3, &fields(json!({"whoLiked": [1]})));
        assert!(matches!(result, Err(AppError::InvalidDocument(_))));
    }

    #[test]
    fn test_from_fields_rejects_mistyped_field() {
        let result = MovieDocument::from_fields(3, &fields(json!({"whoLiked": "1,2"})));
        assert!(matches!(result, Err(AppError::InvalidDocument(_))));
    }

    #[test]
    fn test_from_fields_ignores_extra_fields() {
        let doc =
            MovieDocument::from_fields(3, &fields(json!({"whoLiked": [4], "title": "x"}))).unwrap();
        assert_eq!(doc.who_liked, vec![4]);
    }

    #[test]
    fn test_inverse_kinds_are_swapped() {
        assert_eq!(
            <<UserDocument as Entity>::Inverse as Entity>::KIND,
            EntityKind::Movie
        );
        assert_eq!(
            <<MovieDocument as Entity>::Inverse as Entity>::KIND,
            EntityKind::User
        );
    }

    #[test]
    fn test_collections_of() {
        let collections = Collections::new("users_shadow", "movies");
        assert_eq!(collections.of(EntityKind::User), "users_shadow");
        assert_eq!(collections.of(EntityKind::Movie), "movies");
    }

    #[test]
    fn test_bulk_entries_accept_both_shapes() {
        let entries: Vec<UserBulkEntry> = serde_json::from_value(json!([
            {"id": 1, "likedMovies": [2]},
            {"user_id": 3, "liked_movies": [4, 5]}
        ]))
        .unwrap();
        assert_eq!(entries[0].id, 1);
        assert_eq!(entries[1].liked_movies, vec![4, 5]);

        let entries: Vec<MovieBulkEntry> = serde_json::from_value(json!([
            {"movie_id": 9, "users_who_liked_movie": [1]}
        ]))
        .unwrap();
        let (id, users): (MovieId, Vec<UserId>) = entries[0].clone().into();
        assert_eq!((id, users), (9, vec![1]));
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("90000").unwrap(), 90000);
        assert!(matches!(parse_id("abc"), Err(AppError::InvalidInput(_))));
        assert!(matches!(parse_id("1.5"), Err(AppError::InvalidInput(_))));
    }
}
