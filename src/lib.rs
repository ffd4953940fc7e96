//! Support chat client for the rental management backend.
//!
//! A tenant talks to the support admin; the admin works through an inbox of
//! tenants. Each open conversation is kept in sync by a [`chat::SyncEngine`]
//! against either the hosted backend ([`api`]) or the embedded [`storage`].

pub mod api;
pub mod app;
pub mod chat;
pub mod console;
pub mod error;
pub mod storage;
pub mod utils;

pub use error::{ChatError, Result};
