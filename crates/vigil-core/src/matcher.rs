//! Identity resolution against the known-person gallery.

use crate::types::{Embedding, IdentityLabel, KnownPerson};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GalleryError {
    #[error("person already registered: {0}")]
    Duplicate(String),
    #[error("person name must not be empty")]
    EmptyName,
}

/// Ordered set of known persons, keyed by unique name.
///
/// Iteration follows insertion order, which is also the tie-break order
/// for equal similarity scores.
#[derive(Debug, Default, Clone)]
pub struct Gallery {
    persons: Vec<KnownPerson>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, person: KnownPerson) -> Result<(), GalleryError> {
        if person.name.trim().is_empty() {
            return Err(GalleryError::EmptyName);
        }
        if self.contains(&person.name) {
            return Err(GalleryError::Duplicate(person.name));
        }
        self.persons.push(person);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<KnownPerson> {
        let idx = self.persons.iter().position(|p| p.name == name)?;
        Some(self.persons.remove(idx))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.persons.iter().any(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.persons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.persons.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KnownPerson> {
        self.persons.iter()
    }
}

impl FromIterator<KnownPerson> for Gallery {
    /// Builds a gallery, keeping the first entry for any repeated name.
    fn from_iter<I: IntoIterator<Item = KnownPerson>>(iter: I) -> Self {
        let mut gallery = Gallery::new();
        for person in iter {
            let _ = gallery.insert(person);
        }
        gallery
    }
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Name of the accepted match, if any entry cleared the threshold.
    pub name: Option<String>,
    /// Similarity of the accepted match; 0.0 when nothing was accepted.
    pub similarity: f32,
}

impl MatchResult {
    pub fn no_match() -> Self {
        Self {
            name: None,
            similarity: 0.0,
        }
    }

    pub fn is_match(&self) -> bool {
        self.name.is_some()
    }

    /// Identity plus the confidence to report for it. Unrecognized always
    /// reports 0.0.
    pub fn into_identity(self) -> (IdentityLabel, f32) {
        match self.name {
            Some(name) => (IdentityLabel::Known(name), self.similarity),
            None => (IdentityLabel::Unrecognized, 0.0),
        }
    }
}

/// Strategy for comparing a probe embedding against the gallery.
///
/// An approximate index can replace the linear scan behind this trait
/// without changing callers.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult;
}

/// Linear-scan cosine similarity matcher.
///
/// A candidate is accepted only if it beats both the running best and the
/// threshold, strictly. Equal scores keep the earlier gallery entry.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
        if probe.is_empty() {
            return MatchResult::no_match();
        }

        let mut best = MatchResult::no_match();
        for person in gallery.iter() {
            let sim = probe.similarity(&person.embedding);
            if sim > best.similarity && sim > threshold {
                best = MatchResult {
                    name: Some(person.name.clone()),
                    similarity: sim,
                };
            }
        }
        best
    }
}
