#![allow(clippy::missing_docs_in_private_items)]

pub mod error;

pub mod storage {
    pub mod db;
    pub mod sink;
    pub mod types;
}

pub mod utils {
    pub mod config;
}
