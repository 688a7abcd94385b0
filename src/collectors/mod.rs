pub mod guests;

use crate::state::GuestSnapshot;
use std::collections::BTreeMap;

/// Everything one successful poll cycle produced.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub nodes: Vec<String>,
    pub attributes: BTreeMap<u64, String>,
    pub guests: Vec<GuestSnapshot>,
}
