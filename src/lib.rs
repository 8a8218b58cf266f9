//! Resolves a video page URL to a playable file and delivers it, streaming
//! the direct link when one exists and merging streams locally otherwise.

pub mod catalog;
pub mod config;
pub mod error;
pub mod extractor;
pub mod fallback;
pub mod filename;
pub mod orchestrator;
pub mod proxy;
pub mod retry;
pub mod routes;
pub mod selector;
pub mod sniffer;

#[cfg(test)]
mod test_support;
