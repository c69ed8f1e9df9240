//! Utility functions and well-known constants.
//!
//! This module provides the event-type vocabulary shared by emitters and
//! consumers, plus the sanitization helpers that keep binary payloads and
//! oversized attachments out of durable event history.

pub mod constants;
pub mod sanitize;

pub use constants::*;
pub use sanitize::*;
