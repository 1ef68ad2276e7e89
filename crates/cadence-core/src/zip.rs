//! Jurisdiction inference from postal codes.
//!
//! A static table of 3-digit ZIP prefix ranges. Coarser than a full ZIP
//! database but sufficient for state resolution, which is all the rule
//! engine needs.

/// (first prefix, last prefix, state) over the leading three digits.
const PREFIX_RANGES: &[(u32, u32, &str)] = &[
    (5, 5, "NY"),
    (10, 27, "MA"),
    (28, 29, "RI"),
    (30, 38, "NH"),
    (39, 49, "ME"),
    (50, 59, "VT"),
    (60, 69, "CT"),
    (70, 89, "NJ"),
    (100, 149, "NY"),
    (150, 196, "PA"),
    (197, 199, "DE"),
    (200, 205, "DC"),
    (206, 219, "MD"),
    (220, 246, "VA"),
    (247, 268, "WV"),
    (270, 289, "NC"),
    (290, 299, "SC"),
    (300, 319, "GA"),
    (320, 339, "FL"),
    (342, 342, "FL"),
    (344, 344, "FL"),
    (346, 347, "FL"),
    (349, 349, "FL"),
    (350, 369, "AL"),
    (370, 385, "TN"),
    (386, 397, "MS"),
    (398, 399, "GA"),
    (400, 427, "KY"),
    (430, 459, "OH"),
    (460, 479, "IN"),
    (480, 499, "MI"),
    (500, 528, "IA"),
    (530, 549, "WI"),
    (550, 567, "MN"),
    (570, 577, "SD"),
    (580, 588, "ND"),
    (590, 599, "MT"),
    (600, 629, "IL"),
    (630, 658, "MO"),
    (660, 679, "KS"),
    (680, 693, "NE"),
    (700, 714, "LA"),
    (716, 729, "AR"),
    (730, 749, "OK"),
    (750, 799, "TX"),
    (800, 816, "CO"),
    (820, 831, "WY"),
    (832, 838, "ID"),
    (840, 847, "UT"),
    (850, 865, "AZ"),
    (870, 884, "NM"),
    (885, 885, "TX"),
    (889, 898, "NV"),
    (900, 961, "CA"),
    (962, 966, "CA"),
    (967, 968, "HI"),
    (970, 979, "OR"),
    (980, 994, "WA"),
    (995, 999, "AK"),
];

/// Resolve a two-letter state code from a ZIP code. Accepts 5-digit and
/// ZIP+4 forms; anything without three leading digits yields `None`.
pub fn state_for_zip(zip: &str) -> Option<&'static str> {
    let digits: String = zip.trim().chars().take(3).collect();
    if digits.len() < 3 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let prefix: u32 = digits.parse().ok()?;
    PREFIX_RANGES
        .iter()
        .find(|(lo, hi, _)| (*lo..=*hi).contains(&prefix))
        .map(|(_, _, state)| *state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_prefixes() {
        assert_eq!(state_for_zip("94110"), Some("CA"));
        assert_eq!(state_for_zip("89101"), Some("NV"));
        assert_eq!(state_for_zip("62704"), Some("IL"));
        assert_eq!(state_for_zip("06510"), Some("CT"));
        assert_eq!(state_for_zip("63101-1234"), Some("MO"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(state_for_zip(""), None);
        assert_eq!(state_for_zip("12"), None);
        assert_eq!(state_for_zip("ABCDE"), None);
        // Unassigned prefix.
        assert_eq!(state_for_zip("00010"), None);
    }
}
