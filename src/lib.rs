pub mod cancel;
pub mod catalog;
pub mod config;
pub mod digest;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod fs_util;
pub mod hooks;
pub mod lock;
pub mod output;
pub mod populate;
pub mod pull;
pub mod registry;
pub mod relations;
pub mod seqcol;
pub mod store;
