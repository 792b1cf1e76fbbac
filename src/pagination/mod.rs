//! Pagination module
//!
//! Supports: Offset, Opaque Token, Search-after, Date-bounded Windowing,
//! Multi-endpoint, Single-shot, Index of URLs, Detail Expansion,
//! Streaming Element Splitting
//!
//! # Overview
//!
//! Every source is a [`PaginationStrategy`]: a forward-only producer of
//! pages that owns its own cursor and decides when the harvest is done.
//! Strategies make their requests through a [`PageContext`], which routes
//! them over the run's client and retry budget and retries responses that
//! lack an expected field.

mod multi;
mod strategies;
mod streaming;
mod types;
mod windowed;

pub use multi::{MultiEndpointPaginator, Section};
pub use strategies::{
    search_after_value, Advance, ExpandPaginator, IndexPaginator, NextRequest, OffsetPaginator,
    PageLimit, PageRecovery, ParamCarry, SearchAfterPaginator, SinglePaginator, TokenPaginator,
    RESULT_WINDOW,
};
pub use streaming::StreamingPaginator;
pub use types::{
    count_of, into_records, token_string, PageContext, PaginationStrategy, RecordsAt, RunFlags,
    StopCondition,
};
pub use windowed::{WindowBoundary, WindowedPaginator};
