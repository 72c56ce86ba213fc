//! Connection pool construction for the relational store.

mod postgres;

pub(super) use postgres::{ConnectionPool, MIGRATIONS};
