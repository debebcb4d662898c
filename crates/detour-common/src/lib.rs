//! Common utilities and data structures shared by the Detour crates

use std::borrow::Cow;

mod geometry;
mod math;

pub use geometry::*;
pub use math::*;

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParam(Cow<'static, str>),

    #[error("out of memory: {0}")]
    OutOfMemory(Cow<'static, str>),

    #[error("queue is full")]
    Full,

    #[error("search ran out of nodes")]
    OutOfNodes,

    #[error("buffer too small, {required} entries required")]
    BufferTooSmall { required: usize },

    #[error("invalidated: {0}")]
    Invalidated(Cow<'static, str>),

    #[error("wrong magic number in tile data")]
    WrongMagic,

    #[error("wrong tile data version {found}, expected {expected}")]
    WrongVersion { found: i32, expected: i32 },

    #[error("tile location ({x}, {y}, layer {layer}) is already occupied")]
    AlreadyOccupied { x: i32, y: i32, layer: i32 },

    #[error("operation failed: {0}")]
    Failure(Cow<'static, str>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for [`Error::InvalidParam`]
    pub fn invalid_param(msg: impl Into<Cow<'static, str>>) -> Self {
        Error::InvalidParam(msg.into())
    }

    /// Shorthand for [`Error::Invalidated`]
    pub fn invalidated(msg: impl Into<Cow<'static, str>>) -> Self {
        Error::Invalidated(msg.into())
    }
}

/// Result type for operations
pub type Result<T> = std::result::Result<T, Error>;
