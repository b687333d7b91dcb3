//! Status-gated update of persisted lines from freshly generated content
//!
//! - `Valid` lines only take the period, invoice date and (flat fee) unit
//!   amount from the expected content. Name, tax settings and any manual edit
//!   survive.
//! - `Split` lines were progressively billed; their children are moved along
//!   with a changed period end.
//! - Anything else reaching the diff is corrupt data and aborts the sync.

use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::line::{Line, LineArena, LineInput, LinePricing, LineStatus};

/// Merge `expected` into the arena line at `idx`. Returns the number of split
/// children soft-deleted by a shrink.
pub fn merge_line(
    arena: &mut LineArena,
    idx: usize,
    expected: &LineInput,
    now: OffsetDateTime,
) -> BillingResult<usize> {
    let status = arena
        .get(idx)
        .map(|line| line.status)
        .ok_or_else(|| BillingError::InvariantViolation(format!("line index {idx} out of range")))?;

    match status {
        LineStatus::Valid => {
            if let Some(line) = arena.get_mut(idx) {
                merge_valid(line, expected);
            }
            Ok(0)
        }
        LineStatus::Split => merge_split(arena, idx, expected, now),
        other => Err(BillingError::UnexpectedLineStatus {
            line_id: arena.get(idx).map(|l| l.id).unwrap_or_default(),
            status: other.to_string(),
        }),
    }
}

fn merge_valid(line: &mut Line, expected: &LineInput) {
    line.period = expected.period;
    line.invoice_at = expected.invoice_at;

    if let (LinePricing::FlatFee(current), LinePricing::FlatFee(target)) =
        (&mut line.pricing, &expected.pricing)
    {
        current.per_unit_amount = target.per_unit_amount;
    }

    // Back in scope after an earlier soft delete
    line.deleted_at = None;
}

fn merge_split(
    arena: &mut LineArena,
    idx: usize,
    expected: &LineInput,
    now: OffsetDateTime,
) -> BillingResult<usize> {
    let (parent_id, old_end) = match arena.get(idx) {
        Some(parent) => (parent.id, parent.period.end),
        None => return Ok(0),
    };
    let new_end = expected.period.end;

    let children: Vec<usize> = arena
        .children_of(parent_id)
        .iter()
        .copied()
        .filter(|&c| arena.get(c).is_some_and(|child| !child.is_deleted()))
        .collect();
    let mut deleted = 0;

    if new_end > old_end {
        let last = children
            .iter()
            .copied()
            .max_by_key(|&c| arena.get(c).map(|child| child.period.end))
            .ok_or_else(|| {
                BillingError::InvariantViolation(format!("split line {parent_id} has no children"))
            })?;

        if let Some(child) = arena.get_mut(last) {
            child.period.end = new_end;
            child.invoice_at = new_end;
        }
    } else if new_end < old_end {
        for c in children {
            let Some(child) = arena.get_mut(c) else {
                continue;
            };

            if child.period.start >= new_end {
                child.deleted_at = Some(now);
                deleted += 1;
                continue;
            }

            if child.period.end > new_end {
                child.period.end = new_end;
                if child.invoice_at > new_end {
                    child.invoice_at = new_end;
                }
            }
        }
    }

    if let Some(parent) = arena.get_mut(idx) {
        parent.period.end = new_end;
        parent.invoice_at = expected.invoice_at;
    }

    Ok(deleted)
}
