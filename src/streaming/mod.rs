//! Stream gateway (C5-C8): admits a viewer, decides how to serve the
//! upstream (direct passthrough, remux, or transcode), supervises the
//! encoder process when one is needed, and tracks the resulting session.

pub mod classify;
pub mod encoder;
pub mod gateway;
pub mod session;
