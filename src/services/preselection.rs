use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::{
    db::{DocumentStore, ID_FIELD},
    error::{AppError, AppResult},
    models::{Entity, MovieDocument, MovieId, UserDocument, UserId},
};

/// One-hop collaborative-filtering candidate generator.
///
/// Neighbours are documents of the same kind sharing at least one related id
/// with the subject. The candidates are the union of the neighbours' related ids
/// minus the ids the subject already has. No weighting, no ranking, no limit.
#[derive(Clone)]
pub struct PreselectionEngine {
    store: Arc<dyn DocumentStore>,
}

impl PreselectionEngine {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Movies liked by users who share a liked movie with `id`
    pub async fn preselect_for_user(&self, id: UserId, users: &str) -> AppResult<BTreeSet<MovieId>> {
        self.preselect::<UserDocument>(id, users).await
    }

    /// Users who liked a movie that shares a liking user with `id`
    pub async fn preselect_for_movie(
        &self,
        id: MovieId,
        movies: &str,
    ) -> AppResult<BTreeSet<UserId>> {
        self.preselect::<MovieDocument>(id, movies).await
    }

    pub async fn preselect<E: Entity>(&self, id: i64, collection: &str) -> AppResult<BTreeSet<i64>> {
        // Locate the subject through search, like any other document
        let subject = self
            .store
            .find_by_term(collection, ID_FIELD, &Value::from(id))
            .await?
            .into_iter()
            .find(|doc| doc.id == id)
            .ok_or_else(|| {
                AppError::NotFound(format!("{} {} in '{}'", E::KIND, id, collection))
            })?;

        let subject = E::from_fields(id, &subject.fields)?;
        let known: HashSet<i64> = subject.related().iter().copied().collect();
        if known.is_empty() {
            return Ok(BTreeSet::new());
        }

        // Neighbours share at least one related id
        let terms: Vec<Value> = known.iter().map(|related| Value::from(*related)).collect();
        let neighbours = self
            .store
            .find_by_any_term(collection, E::FIELD, &terms)
            .await?;

        // Union of the neighbours' ids minus what the subject already has
        let mut candidates = BTreeSet::new();
        let mut neighbour_count = 0;
        for neighbour in neighbours.iter().filter(|doc| doc.id != id) {
            let doc = match E::from_fields(neighbour.id, &neighbour.fields) {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed neighbour");
                    continue;
                }
            };
            neighbour_count += 1;
            candidates.extend(
                doc.related()
                    .iter()
                    .copied()
                    .filter(|related| !known.contains(related)),
            );
        }

        tracing::info!(
            kind = %E::KIND,
            id,
            collection = %collection,
            neighbours = neighbour_count,
            candidates = candidates.len(),
            "Preselection computed"
        );

        Ok(candidates)
    }
}
