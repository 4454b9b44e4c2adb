// SPDX-License-Identifier: AGPL-3.0-or-later
// Lodestone - Entity Query Engine
// Copyright (C) 2026 Lodestone Contributors (https://github.com/lodestone-db)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! # Lodestone Core — Shared Primitives
//!
//! The leaf-level building blocks every other Lodestone crate stands on:
//!
//! - [`strings`] — reference-counted string intern pool with static IDs
//! - [`value`] — the tagged immediate-value cell stored in the entity matrix
//! - [`intset`] — dual-representation (sorted-vector / bit-array) index sets
//! - [`random`] — seeded, forkable random streams for deterministic queries
//! - [`code`] — the interface the query engine holds onto code trees through
//! - [`error`] — the engine-wide error taxonomy
//!
//! Nothing in this crate knows about entities, columns, or queries; it is
//! purely the substrate those are built from.

pub mod code;
pub mod error;
pub mod intset;
pub mod random;
pub mod strings;
pub mod value;

pub use code::{ArenaCodeStore, CodeHandle, CodeStore};
pub use error::{QueryBudget, QueryError};
pub use intset::IndexSet;
pub use random::RandomStream;
pub use strings::{StringId, StringPool, StringRef};
pub use value::{Value, ValueKind};
