// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 nvmalloc contributors
//
// Error taxonomy. Exhaustion and duplicate-name errors leave the allocator
// state unchanged; Io and Corrupt are fatal to the operation that hit them.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The backing store could not be grown or mapped.
    #[error("nvm I/O error: {0}")]
    Io(#[from] io::Error),

    /// The reserved virtual region has no room for more chunks.
    #[error("nvm region exhausted")]
    Exhausted,

    /// All object-table slots are in use.
    #[error("object table capacity reached")]
    TableFull,

    /// `reserve_named` was called with an id that is already bound.
    #[error("duplicate object id {0:?}")]
    DuplicateName(String),

    /// An object id longer than the persistent slot can hold.
    #[error("object id {0:?} exceeds the maximum id length")]
    NameTooLong(String),

    /// Recovery found a persistent state that cannot be healed.
    #[error("corrupt persistent state: {0}")]
    Corrupt(String),
}
