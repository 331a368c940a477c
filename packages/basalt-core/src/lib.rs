//! # Basalt Core
//!
//! A multi-tenant, end-to-end-encrypted, content-addressed document store
//! with peer-to-peer synchronization.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         BASALT CORE MODULES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐   ┌──────────────┐   ┌─────────────────────────────┐  │
//! │  │  Database   │   │  Sync Engine │   │  Auth & Directory           │  │
//! │  │  (facade)   │   │              │   │                             │  │
//! │  │ - change    │   │ - pull/push  │   │ - challenge/response        │  │
//! │  │ - documents │   │ - bloom diff │   │ - session tokens            │  │
//! │  │ - attach    │   │ - batches    │   │ - grant/revoke trust set    │  │
//! │  └──────┬──────┘   └──────┬───────┘   └──────────┬──────────────────┘  │
//! │         │                 │                      │                      │
//! │         └────────────┬────┴──────────────────────┘                      │
//! │                      ▼                                                  │
//! │  ┌─────────────┐   ┌──────────────┐   ┌─────────────────────────────┐  │
//! │  │  Document   │   │  Entry Codec │   │  Content-Addressed Store    │  │
//! │  │  Assembler  │   │              │   │                             │  │
//! │  │ - topo sort │   │ - canonical  │   │ - memory / SQLite           │  │
//! │  │ - CRDT fold │   │ - sign/seal  │   │ - indices, dedup, bloom     │  │
//! │  └─────────────┘   └──────┬───────┘   └─────────────────────────────┘  │
//! │                           ▼                                             │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Crypto: AES-GCM · Ed25519 · RSA-OAEP · PBKDF2 · HKDF · SHA-256 │   │
//! │  │  KeyBag: named symmetric keys with version history              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! Every mutation is an immutable entry: serialized, encrypted with a
//! named symmetric key from the session's [`keybag::KeyBag`], signed with
//! the author's Ed25519 key, and addressed by the hash of its canonical
//! metadata. Replicas exchange entries without needing the keys to read
//! them; the [`directory`] decides which signing keys are trusted, and
//! the [`sync`] engine verifies every entry it accepts.

#![warn(missing_docs)]

pub mod auth;
pub mod crypto;
pub mod db;
pub mod directory;
pub mod document;
pub mod entry;
pub mod error;
pub mod keybag;
pub mod store;
pub mod sync;
/// Wall-clock helpers (millisecond Unix timestamps).
pub mod time;

pub use db::{ChangedDocument, Database, DocBuilder};
pub use document::Document;
pub use entry::{Entry, EntryMetadata, EntryType};
pub use error::{Error, Result};
pub use keybag::{KeyBag, KeyScope};
pub use store::{EntryStore, MemoryEntryStore, ScanCursor, SqliteEntryStore};
pub use sync::{SyncOptions, SyncResult};
