//! Relation manager keeping `User.likedMovies` and `Movie.whoLiked` mutual inverses.
//!
//! The two sides live in independent documents with no transaction spanning them.
//! Consistency is restored by ordered read-modify-write steps: the subject document
//! is written first, then every neighbour document on the inverse side. A store
//! failure aborts the remaining steps; writes already made are not rolled back.
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    config::{Config, WriteMode},
    db::{DocumentStore, Precondition},
    error::{AppError, AppResult},
    models::{Collections, Entity, MovieDocument, MovieId, UserDocument, UserId},
};

/// Change applied to a neighbour's adjacency list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeEdit {
    Append,
    Remove,
}

#[derive(Clone)]
pub struct RelationManager {
    store: Arc<dyn DocumentStore>,
    write_mode: WriteMode,
    max_conflict_retries: u32,
    parallel_propagation: bool,
}

impl RelationManager {
    pub fn new(store: Arc<dyn DocumentStore>, config: &Config) -> Self {
        Self {
            store,
            write_mode: config.write_mode,
            max_conflict_retries: config.max_conflict_retries,
            parallel_propagation: config.parallel_propagation,
        }
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode, max_conflict_retries: u32) -> Self {
        self.write_mode = write_mode;
        self.max_conflict_retries = max_conflict_retries;
        self
    }

    pub fn with_parallel_propagation(mut self, enabled: bool) -> Self {
        self.parallel_propagation = enabled;
        self
    }

    pub async fn get_user(&self, id: UserId, users: &str) -> AppResult<UserDocument> {
        self.get::<UserDocument>(id, users).await
    }

    pub async fn get_movie(&self, id: MovieId, movies: &str) -> AppResult<MovieDocument> {
        self.get::<MovieDocument>(id, movies).await
    }

    pub async fn add_user(
        &self,
        id: UserId,
        liked_movies: Vec<MovieId>,
        collections: &Collections,
    ) -> AppResult<()> {
        self.add::<UserDocument>(id, liked_movies, collections).await
    }

    pub async fn add_movie(
        &self,
        id: MovieId,
        who_liked: Vec<UserId>,
        collections: &Collections,
    ) -> AppResult<()> {
        self.add::<MovieDocument>(id, who_liked, collections).await
    }

    /// Replaces a user's liked movies without touching the movie side
    pub async fn update_user(
        &self,
        id: UserId,
        liked_movies: Vec<MovieId>,
        users: &str,
    ) -> AppResult<()> {
        self.update::<UserDocument>(id, liked_movies, users).await
    }

    /// Replaces a movie's liking users without touching the user side
    pub async fn update_movie(
        &self,
        id: MovieId,
        who_liked: Vec<UserId>,
        movies: &str,
    ) -> AppResult<()> {
        self.update::<MovieDocument>(id, who_liked, movies).await
    }

    pub async fn delete_user(&self, id: UserId, collections: &Collections) -> AppResult<()> {
        self.delete::<UserDocument>(id, collections).await
    }

    pub async fn delete_movie(&self, id: MovieId, collections: &Collections) -> AppResult<()> {
        self.delete::<MovieDocument>(id, collections).await
    }

    pub async fn bulk_update_users(
        &self,
        entries: Vec<(UserId, Vec<MovieId>)>,
        collections: &Collections,
    ) -> AppResult<()> {
        self.bulk_update::<UserDocument>(entries, collections).await
    }

    pub async fn bulk_update_movies(
        &self,
        entries: Vec<(MovieId, Vec<UserId>)>,
        collections: &Collections,
    ) -> AppResult<()> {
        self.bulk_update::<MovieDocument>(entries, collections).await
    }

    /// Reads a document that must exist
    pub async fn get<E: Entity>(&self, id: i64, collection: &str) -> AppResult<E> {
        match self.store.get(collection, id).await? {
            Some(stored) => E::from_fields(id, &stored.fields),
            None => Err(AppError::NotFound(format!(
                "{} {} in '{}'",
                E::KIND,
                id,
                collection
            ))),
        }
    }

    async fn add<E: Entity>(
        &self,
        id: i64,
        related: Vec<i64>,
        collections: &Collections,
    ) -> AppResult<()> {
        let own = collections.of(E::KIND);
        let inverse = collections.of(<E::Inverse as Entity>::KIND);

        // subject first, then one append per listed neighbour
        let doc = E::from_related(related);
        self.store.upsert(own, id, doc.to_fields()?).await?;

        self.propagate::<E::Inverse>(inverse, id, doc.related(), EdgeEdit::Append)
            .await?;

        tracing::info!(
            kind = %E::KIND,
            id,
            collection = %own,
            related = doc.related().len(),
            "Document added"
        );
        Ok(())
    }

    async fn update<E: Entity>(&self, id: i64, related: Vec<i64>, collection: &str) -> AppResult<()> {
        let doc = E::from_related(related);
        self.store.upsert(collection, id, doc.to_fields()?).await?;

        tracing::info!(
            kind = %E::KIND,
            id,
            collection = %collection,
            related = doc.related().len(),
            "Document replaced"
        );
        Ok(())
    }

    async fn delete<E: Entity>(&self, id: i64, collections: &Collections) -> AppResult<()> {
        let own = collections.of(E::KIND);
        let inverse = collections.of(<E::Inverse as Entity>::KIND);

        // the neighbour list is only known from the document being deleted
        let doc: E = self.get(id, own).await?;
        self.store.delete(own, id).await?;

        self.propagate::<E::Inverse>(inverse, id, doc.related(), EdgeEdit::Remove)
            .await?;

        tracing::info!(
            kind = %E::KIND,
            id,
            collection = %own,
            unlinked = doc.related().len(),
            "Document deleted"
        );
        Ok(())
    }

    /// Per entry: unlink the previous neighbours, replace the document, link the new ones.
    /// Entries are applied in order; a failure stops at that step.
    async fn bulk_update<E: Entity>(
        &self,
        entries: Vec<(i64, Vec<i64>)>,
        collections: &Collections,
    ) -> AppResult<()> {
        let own = collections.of(E::KIND);
        let inverse = collections.of(<E::Inverse as Entity>::KIND);
        let total = entries.len();

        for (id, related) in entries {
            // a missing document is being created by this entry
            let previous = match self.store.get(own, id).await? {
                Some(stored) => E::from_fields(id, &stored.fields)?.related().to_vec(),
                None => Vec::new(),
            };

            // Unlink from every previous neighbour
            self.propagate::<E::Inverse>(inverse, id, &previous, EdgeEdit::Remove)
                .await?;

            // Replace the document itself
            let doc = E::from_related(related);
            self.store.upsert(own, id, doc.to_fields()?).await?;

            // Link to the new neighbours; ones kept from before are re-added here
            self.propagate::<E::Inverse>(inverse, id, doc.related(), EdgeEdit::Append)
                .await?;

            tracing::debug!(
                kind = %E::KIND,
                id,
                previous = previous.len(),
                current = doc.related().len(),
                "Bulk entry applied"
            );
        }

        tracing::info!(kind = %E::KIND, collection = %own, entries = total, "Bulk update completed");
        Ok(())
    }

    /// Applies `edit` for `subject` to each target document of kind `T`.
    ///
    /// Repeated targets are folded into one rewrite with the same net effect,
    /// so the documents touched by one call are pairwise distinct.
    async fn propagate<T: Entity>(
        &self,
        collection: &str,
        subject: i64,
        targets: &[i64],
        edit: EdgeEdit,
    ) -> AppResult<()> {
        let grouped = group_targets(targets);

        if !self.parallel_propagation || grouped.len() < 2 {
            for (target, times) in grouped {
                self.edit_edges::<T>(collection, target, subject, edit, times)
                    .await?;
            }
            return Ok(());
        }

        // Spawn one task per distinct neighbour
        let mut tasks = Vec::with_capacity(grouped.len());
        for (target, times) in grouped {
            let manager = self.clone();
            let collection = collection.to_string();
            let task = tokio::spawn(async move {
                manager
                    .edit_edges::<T>(&collection, target, subject, edit, times)
                    .await
            });
            tasks.push(task);
        }

        // Wait for all of them so no write is left running, then report the first failure
        let mut first_error = None;
        for task in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(AppError::Internal(e.to_string())),
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, subject, "Neighbour update failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Read-modify-write of one neighbour document.
    ///
    /// Appending to a missing document creates it; removing from one is a no-op.
    /// In optimistic mode the write is checked against the version read and
    /// retried from a fresh read on conflict.
    async fn edit_edges<T: Entity>(
        &self,
        collection: &str,
        target: i64,
        subject: i64,
        edit: EdgeEdit,
        times: usize,
    ) -> AppResult<()> {
        let optimistic = self.write_mode == WriteMode::Optimistic;
        let mut retries = 0;

        loop {
            let (mut doc, precondition) = match self.store.get(collection, target).await? {
                Some(stored) => {
                    let precondition = if optimistic {
                        Precondition::Version(stored.version)
                    } else {
                        Precondition::Any
                    };
                    (T::from_fields(target, &stored.fields)?, precondition)
                }
                None if edit == EdgeEdit::Append => {
                    let precondition = if optimistic {
                        Precondition::Absent
                    } else {
                        Precondition::Any
                    };
                    (T::from_related(Vec::new()), precondition)
                }
                None => {
                    tracing::debug!(
                        kind = %T::KIND,
                        id = target,
                        subject,
                        "Neighbour already gone"
                    );
                    return Ok(());
                }
            };

            // nothing to write
            if !apply_edit(doc.related_mut(), subject, edit, times) {
                return Ok(());
            }

            match self
                .store
                .upsert_if(collection, target, doc.to_fields()?, precondition)
                .await
            {
                Ok(()) => return Ok(()),
                Err(AppError::Conflict(_)) if optimistic && retries < self.max_conflict_retries => {
                    retries += 1;
                    tracing::warn!(
                        kind = %T::KIND,
                        id = target,
                        attempt = retries,
                        "Concurrent write detected, retrying"
                    );
                }
                Err(AppError::Conflict(msg)) if optimistic => {
                    return Err(AppError::Conflict(format!(
                        "{} {} still contended after {} retries: {}",
                        T::KIND,
                        target,
                        retries,
                        msg
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Counts occurrences of each target, keeping first-seen order
fn group_targets(targets: &[i64]) -> Vec<(i64, usize)> {
    let mut positions: HashMap<i64, usize> = HashMap::new();
    let mut grouped: Vec<(i64, usize)> = Vec::new();
    for &target in targets {
        match positions.get(&target) {
            Some(&pos) => grouped[pos].1 += 1,
            None => {
                positions.insert(target, grouped.len());
                grouped.push((target, 1));
            }
        }
    }
    grouped
}

/// Applies `edit` `times` times; returns whether the list changed.
///
/// Appends never deduplicate. Each removal drops the first occurrence present.
fn apply_edit(related: &mut Vec<i64>, subject: i64, edit: EdgeEdit, times: usize) -> bool {
    match edit {
        EdgeEdit::Append => {
            related.extend(std::iter::repeat(subject).take(times));
            times > 0
        }
        EdgeEdit::Remove => {
            let mut changed = false;
            for _ in 0..times {
                match related.iter().position(|&id| id == subject) {
                    Some(pos) => {
                        related.remove(pos);
                        changed = true;
                    }
                    None => break,
                }
            }
            changed
        }
    }
}
