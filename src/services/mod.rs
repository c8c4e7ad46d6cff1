//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own canvas logic and persistence so route handlers stay
//! focused on protocol translation.

pub mod canvas;
pub mod chat;
pub mod persistence;
pub mod placement;
