//! Size-bounded batch request construction.
//!
//! This module defines [`AddEventsRequest`], an incrementally-built
//! `/addEvents` request body with a hard byte ceiling. Appends that would
//! push the serialised request past the ceiling are rejected without
//! changing any observable state, so a caller can fill a request to capacity
//! and ship the rest in the next batch. [`Position`] snapshots support
//! rolling back a partially-appended run of events, for example when a
//! collector discovers mid-batch that its source has been truncated.

mod builder;


pub use builder::{
    AddEventsRequest, DEFAULT_MAX_REQUEST_SIZE, JsonMap, Position, RequestError, ThreadDescriptor,
};
