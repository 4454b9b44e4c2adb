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

//! # Lodestone Store — Separable Box-Filter Data Store
//!
//! A spatial acceleration structure for high-dimensional, mixed-type data
//! with no constraints on the metric space. The store supports cheap
//! modification of the query-time parameters — p-value, nominal flags,
//! weights, accuracy mode, feature and entity sub-selections — without any
//! rebuild, because the per-column indexes are metric-agnostic.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                  BoxFilterStore                       │
//! │                                                       │
//! │  matrix: entities × columns of immediate values       │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐               │
//! │  │ Column 0 │ │ Column 1 │ │ Column … │  per-label    │
//! │  │ numbers  │ │ numbers  │ │ numbers  │  status sets, │
//! │  │ strings  │ │ strings  │ │ strings  │  sorted value │
//! │  │ null/nan │ │ null/nan │ │ null/nan │  vectors      │
//! │  └──────────┘ └──────────┘ └──────────┘               │
//! │        ↓            ↓            ↓                    │
//! │  partial sums per candidate  ──►  k-NN resolution     │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`entity`] — the interface entities expose to the store
//! - [`column`] — per-label index over one column of the matrix
//! - [`matrix`] — the store itself: row-major matrix + column indexes
//! - [`distance`] — generalized Minkowski distance with per-feature types
//! - [`fastmath`] — approximate powers for low-accuracy distance mode
//! - [`partial_sums`] — per-candidate running sums with feature bitmaps
//! - [`knn`] — seeded partial-sum k-NN and radius search

pub mod column;
pub mod distance;
pub mod entity;
pub mod fastmath;
pub mod knn;
pub mod matrix;
pub mod partial_sums;

pub use column::{CellStatus, ColumnData};
pub use distance::{DistanceParams, FeatureAttributes, FeatureParams, FeatureType};
pub use entity::{Entity, EntitySource};
pub use knn::{DistanceResult, SearchScratch};
pub use matrix::BoxFilterStore;
pub use partial_sums::PartialSumCollection;
