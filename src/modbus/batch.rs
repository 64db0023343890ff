//! Read batch planning.
//!
//! Devices expose sparse register maps; issuing one request per register is
//! wasteful while a single oversized span trips the protocol ceiling or
//! sweeps unimplemented gaps. The planner sorts registers by address and
//! merges neighbours while the configured gap and the frame ceiling allow.

use crate::registers::{RegisterCategory, RegisterDefinition};

/// Protocol ceiling for a single read request, in words.
pub const MAX_READ_WORDS: u16 = 125;
/// Protocol ceiling for a single multi register write, in words.
pub const MAX_WRITE_WORDS: u16 = 123;

/// A contiguous span of registers fetched with one request. `members` are
/// indices into the definition slice the plan was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRange {
    pub category: RegisterCategory,
    pub start: u16,
    pub count: u16,
    pub members: Vec<usize>,
}

impl BatchRange {
    /// Word offset of a member register within this batch's response.
    pub fn offset_of(&self, def: &RegisterDefinition) -> usize {
        return (def.address - self.start) as usize;
    }
}

/// Plan read batches over the given definitions. Write only registers are
/// skipped. Two registers land in the same batch when the dead space between
/// them is at most `max_gap` words and the merged span stays within
/// `max_words`.
pub fn plan_batches(
    defs: &[RegisterDefinition],
    max_gap: u16,
    max_words: u16,
) -> Vec<BatchRange> {
    let max_words = max_words.min(MAX_READ_WORDS);
    let mut batches = Vec::new();
    for category in [RegisterCategory::Input, RegisterCategory::Holding] {
        let mut indexed: Vec<usize> = defs
            .iter()
            .enumerate()
            .filter(|(_, d)| d.register_type.readable() && d.category() == category)
            .map(|(i, _)| i)
            .collect();
        indexed.sort_by_key(|&i| defs[i].address);
        batches.extend(merge_sorted(defs, category, &indexed, max_gap, max_words));
    }
    return batches;
}

fn merge_sorted(
    defs: &[RegisterDefinition],
    category: RegisterCategory,
    sorted: &[usize],
    max_gap: u16,
    max_words: u16,
) -> Vec<BatchRange> {
    let mut batches: Vec<BatchRange> = Vec::new();
    for &idx in sorted {
        let def = &defs[idx];
        /* widen to u32: 65535 is a valid address, the end may not fit u16 */
        let end = u32::from(def.address) + u32::from(def.count);
        if let Some(current) = batches.last_mut() {
            let current_end = u32::from(current.start) + u32::from(current.count);
            /* registers overlapping the current span always merge */
            let gap = u32::from(def.address).saturating_sub(current_end);
            let span = end.max(current_end) - u32::from(current.start);
            if gap <= u32::from(max_gap) && span <= u32::from(max_words) {
                current.count = span as u16;
                current.members.push(idx);
                continue;
            }
        }
        batches.push(BatchRange {
            category,
            start: def.address,
            count: def.count,
            members: vec![idx],
        });
    }
    return batches;
}
