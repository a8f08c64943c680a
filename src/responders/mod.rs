mod cached;
mod canned;

pub use cached::CachedGenerator;
pub use canned::{extract_topic, CannedResponder};
