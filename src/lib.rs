#![forbid(unsafe_code)]

pub mod assemble;
pub mod cleanup;
pub mod cli;
pub mod completion;
pub mod config;
pub mod convert;
pub mod epub;
pub mod error;
pub mod formats;
pub mod gemini;
pub mod ledger;
pub mod logging;
pub mod pdf;
pub mod retry;
pub mod sanitize;
pub mod structure;
pub mod translate;
pub mod workspace;
