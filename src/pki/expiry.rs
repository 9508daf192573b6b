//! Rotation threshold: a certificate is due for rotation once half of its
//! validity window has elapsed.

use time::OffsetDateTime;

/// Midpoint of `[not_before, not_after]`.
pub fn rotation_threshold(not_before: OffsetDateTime, not_after: OffsetDateTime) -> OffsetDateTime {
    not_before + (not_after - not_before) / 2
}

/// True once `now` has reached the midpoint of the validity window. Exactly at
/// the midpoint counts as due.
pub fn is_rotation_due(
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    now: OffsetDateTime,
) -> bool {
    now >= rotation_threshold(not_before, not_after)
}
