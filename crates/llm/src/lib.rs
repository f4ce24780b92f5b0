//! Text-generation capability used by the persona core: provider trait,
//! mock providers for tests, and an HTTP provider.

pub mod http;
pub mod provider;
