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

//! # Lodestone Query — Entity Query Engine
//!
//! Queries are ordered lists of [`Condition`]s reduced against a running
//! set of matching entities. Value predicates narrow the set through the
//! column indexes, distance conditions hand off to the k-NN engine,
//! statistics fold the surviving entities into a scalar, and sampling
//! draws from them with the query's seeded stream.
//!
//! ```text
//! conditions ──► QueryCache (labels materialized lazily, RwLocked)
//!        │
//!        ▼
//!   matching_entities ──► ... ──► matching_entities
//!        │ EXISTS/EQUALS/…    │ NEAREST/WITHIN (k-NN)
//!        ▼                    ▼
//!   QueryResult: entities | (distance, entity) pairs | scalar | masses
//! ```
//!
//! ## Modules
//!
//! - [`condition`] — condition types, builder, coalescing normalizations
//! - [`pipeline`] — the reduction loop, budgets, result shapes
//! - [`statistics`] — sum/mode/quantile/means/value-mass computations
//! - [`sampling`] — select, uniform, and weighted sampling
//! - [`conviction`] — k-NN-cache-backed conviction and divergence
//! - [`cache`] — read-write-locked store with lazy column materialization

pub mod cache;
pub mod condition;
pub mod conviction;
pub mod pipeline;
pub mod sampling;
pub mod statistics;

pub use cache::QueryCache;
pub use condition::{Condition, ConditionBuilder, DistanceQuery, DistanceQueryKind, NumericalPrecision};
pub use conviction::{ConvictionProcessor, KnnCache};
pub use pipeline::{QueryEngine, QueryOutcome, QueryResult, QueryScratch};
pub use statistics::DistanceTransform;
