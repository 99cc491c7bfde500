//! Typed selection criteria for store queries.
//!
//! A query is a slice of [`Criterion`]s combined with logical AND. The
//! variants cover the common entity base directly; anything domain-specific
//! goes through [`Criterion::Matches`].

use std::fmt;
use std::sync::Arc;

use crate::entity::StatefulEntity;

type MatchFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// One predicate of a conjunctive query.
pub enum Criterion<T> {
    /// `state == code`
    StateIs(i32),
    /// `state IN (codes)`
    StateIn(Vec<i32>),
    /// `state NOT IN (codes)`
    StateNotIn(Vec<i32>),
    /// `pending == flag`
    Pending(bool),
    /// `state_timestamp < millis`
    StateTimestampBefore(i64),
    /// Arbitrary predicate over the full entity.
    Matches(MatchFn<T>),
}

impl<T: StatefulEntity> Criterion<T> {
    pub fn matches(&self, entity: &T) -> bool {
        let base = entity.entity_state();
        match self {
            Criterion::StateIs(code) => base.state == *code,
            Criterion::StateIn(codes) => codes.contains(&base.state),
            Criterion::StateNotIn(codes) => !codes.contains(&base.state),
            Criterion::Pending(flag) => base.pending == *flag,
            Criterion::StateTimestampBefore(millis) => base.state_timestamp < *millis,
            Criterion::Matches(f) => f(entity),
        }
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Criterion::Matches(Arc::new(f))
    }
}

/// Whether `entity` satisfies every criterion.
pub fn matches_all<T: StatefulEntity>(criteria: &[Criterion<T>], entity: &T) -> bool {
    criteria.iter().all(|c| c.matches(entity))
}

pub fn has_state<T>(code: i32) -> Criterion<T> {
    Criterion::StateIs(code)
}

pub fn state_in<T>(codes: impl Into<Vec<i32>>) -> Criterion<T> {
    Criterion::StateIn(codes.into())
}

pub fn state_not_in<T>(codes: impl Into<Vec<i32>>) -> Criterion<T> {
    Criterion::StateNotIn(codes.into())
}

pub fn is_pending<T>() -> Criterion<T> {
    Criterion::Pending(true)
}

pub fn is_not_pending<T>() -> Criterion<T> {
    Criterion::Pending(false)
}

pub fn state_timestamp_before<T>(millis: i64) -> Criterion<T> {
    Criterion::StateTimestampBefore(millis)
}

impl<T> Clone for Criterion<T> {
    fn clone(&self) -> Self {
        match self {
            Criterion::StateIs(c) => Criterion::StateIs(*c),
            Criterion::StateIn(c) => Criterion::StateIn(c.clone()),
            Criterion::StateNotIn(c) => Criterion::StateNotIn(c.clone()),
            Criterion::Pending(p) => Criterion::Pending(*p),
            Criterion::StateTimestampBefore(t) => Criterion::StateTimestampBefore(*t),
            Criterion::Matches(f) => Criterion::Matches(Arc::clone(f)),
        }
    }
}

impl<T> fmt::Debug for Criterion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criterion::StateIs(c) => write!(f, "state = {}", c),
            Criterion::StateIn(c) => write!(f, "state in {:?}", c),
            Criterion::StateNotIn(c) => write!(f, "state not in {:?}", c),
            Criterion::Pending(p) => write!(f, "pending = {}", p),
            Criterion::StateTimestampBefore(t) => write!(f, "state_timestamp < {}", t),
            Criterion::Matches(_) => write!(f, "<predicate>"),
        }
    }
}
