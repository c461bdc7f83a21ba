//! Inference CLI
//!
//! Wires the coordination layer to real collaborators:
//! - `HttpBackend`: OpenAI-compatible chat completions endpoint
//! - `FsDocumentSource`: documents on disk under `{root}/{org}/{doc}.txt`
//! - `JsonFileRetriever`: pre-computed ranked lists as JSON files

pub mod backend;
pub mod config;
pub mod documents;
pub mod retrievers;

pub use backend::HttpBackend;
pub use config::CliConfig;
pub use documents::FsDocumentSource;
pub use retrievers::JsonFileRetriever;
