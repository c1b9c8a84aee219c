use chrono::{DateTime, Months, Utc};

/// Calculates the new membership expiry date after buying `months` more months.
///
/// The extension is anchored at whichever is later: the current expiry date or `now`. A user who is still covered
/// keeps the time they have already paid for, and a lapsed user starts from today.
///
/// Calendar month arithmetic is used, so Jan 31 + 1 month is the last day of February.
/// Returns `None` if the result would not be representable.
pub fn extend_membership(current: Option<DateTime<Utc>>, now: DateTime<Utc>, months: u32) -> Option<DateTime<Utc>> {
    let anchor = match current {
        Some(expiry) if expiry > now => expiry,
        _ => now,
    };
    anchor.checked_add_months(Months::new(months))
}
