// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod builder;
pub mod engine;
pub mod filter;
pub mod plan;
pub mod scope;

pub use engine::{QueryEngine, SearchPage};
pub use filter::{Direction, SearchRequest};
