//! Repository facade for the Canopy content repository.
//!
//! This crate ties the storage, journal, and cache layers together behind
//! one entry point, [`RepositoryCache`]: a registry of named workspaces
//! over a shared document store, an active-session table, and the
//! repository-wide lock table with lease-based cleanup.
//!
//! Typical embedding:
//!
//! ```
//! use std::sync::Arc;
//! use canopy_repo::{RepositoryCache, RepositoryConfig};
//! use canopy_store::memory::InMemoryDocumentStore;
//!
//! let repo = RepositoryCache::new(
//!     Arc::new(InMemoryDocumentStore::new()),
//!     RepositoryConfig::default(),
//! );
//! repo.create_workspace("content").unwrap();
//!
//! let session = repo.login("content").unwrap();
//! let root = session.workspace().root_key().clone();
//! let article = session.add_child(&root, "article", None).unwrap();
//! session.set_property(&article, "title", "Hello".into()).unwrap();
//! session.save().unwrap();
//! session.logout();
//! ```

pub mod error;
pub mod repository;

pub use error::{RepoError, RepoResult};
pub use repository::{JournalFactory, RepositoryCache, RepositoryConfig};
