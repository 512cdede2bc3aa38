pub mod config;
pub mod error;
pub mod extract;
pub mod sync;

pub mod auth {
    pub mod oauth;
    pub mod token_manager;
    pub mod token_store;
}

pub mod domain {
    pub mod application;
    pub mod credential;
}

pub mod mail {
    pub mod decoders;
    pub mod gmail_client;
    pub mod message;
    pub mod pages;
}

pub mod store {
    pub mod repo;
    pub mod sqlite;
}

pub use error::SyncError;
pub use sync::{SyncOptions, SyncOutcome, SyncReport, Synchronizer};
