use std::collections::HashMap;

use crate::segment::UserSegment;

/// Store is an interface for anything that can resolve segment ids referenced by experiments.
///
/// Experiments only hold segment ids; the definitions are owned by the segment registry and
/// looked up through this trait at evaluation time.
pub trait Store {
    /// Retrieve the segment with id `segment_id`.
    fn segment(&self, segment_id: &str) -> Option<&UserSegment>;
}

impl Store for HashMap<String, UserSegment> {
    fn segment(&self, segment_id: &str) -> Option<&UserSegment> {
        self.get(segment_id)
    }
}
