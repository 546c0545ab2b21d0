//! Core library of the Plue Git service.
//!
//! This crate holds the pieces shared by every front-end: the data model
//! (subjects, teams, repositories, public keys), the SQLite-backed stores,
//! the permission resolution engine, and the sandboxed Git command executor.
//! Network front-ends live in their own crates and depend on this one.
pub mod access;
pub mod config;
pub mod db;
pub mod git;
pub mod identity;
pub mod keys;
pub mod repo;

pub mod prelude {
    //! Common types, re-exported for convenience.
    pub use crate::access::{Actor, Engine, Op, RequestScope, ResolvedPermission};
    pub use crate::git::Executor;
    pub use crate::identity::{AccessMode, OrgId, SubjectId, Unit, UserId, Visibility};
    pub use crate::keys::KeyId;
    pub use crate::repo::{RepoId, Repository};
}
