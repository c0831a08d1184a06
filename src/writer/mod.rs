//! PDF writing for signature updates.
//!
//! ```text
//! PdfDocument (original bytes)
//!     ↓
//! [IncrementalUpdate] (new + replaced objects)
//!     ↓
//! [ObjectSerializer] (serializes PDF objects)
//!     ↓
//! original bytes + appended objects + xref + trailer
//! ```

mod incremental;
mod object_serializer;

pub use incremental::{IncrementalUpdate, WrittenUpdate};
pub use object_serializer::{hex_upper, ObjectSerializer};
