//! Wrap-aware ordering for 16-bit network sequence IDs.
//!
//! Event, chat and lobby-update cursors are all 16-bit counters that wrap
//! during long sessions, so any comparison between two IDs has to use the
//! symmetric-distance rule below instead of raw integer comparison.

/// A 16-bit wrapping sequence number used for events, chat messages and
/// lobby updates.
pub type NetId = u16;

/// Half of the ID space; anything closer than this (going forward) counts
/// as more recent.
const HALF_ID_SPACE: u16 = 32768;

/// Returns true if `a` is more recent than `b` in the cyclic ID space.
///
/// Defined as `(a - b) mod 65536 < 32768`. Note that the rule makes an ID
/// "more recent" than itself; call sites that need strict recency must
/// guard equality separately. At the exact half-space distance neither ID
/// is more recent than the other.
pub fn id_more_recent(a: NetId, b: NetId) -> bool {
    a.wrapping_sub(b) < HALF_ID_SPACE
}

/// Wrapping forward distance from `b` to `a`.
pub fn id_diff(a: NetId, b: NetId) -> u16 {
    a.wrapping_sub(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_ordering() {
        assert!(id_more_recent(2, 1));
        assert!(!id_more_recent(1, 2));
        assert!(id_more_recent(1000, 1));
    }

    #[test]
    fn test_wraparound_ordering() {
        // 2 comes after 65535 once the counter wraps
        assert!(id_more_recent(2, 65535));
        assert!(!id_more_recent(65535, 2));
        assert!(id_more_recent(0, 40000));
    }

    #[test]
    fn test_matches_modular_definition() {
        let samples: [u16; 8] = [0, 1, 2, 100, 32767, 32768, 65000, 65535];
        for &a in &samples {
            for &b in &samples {
                let expected = ((a as u32 + 65536 - b as u32) % 65536) < 32768;
                assert_eq!(
                    id_more_recent(a, b),
                    expected,
                    "id_more_recent({}, {})",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_antisymmetric_except_equal() {
        let samples: [u16; 6] = [0, 1, 12345, 32767, 40000, 65535];
        for &a in &samples {
            for &b in &samples {
                if a == b {
                    continue;
                }
                // never true both ways for distinct IDs
                assert!(
                    !(id_more_recent(a, b) && id_more_recent(b, a)),
                    "both ways for {} / {}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_diff_wraps() {
        assert_eq!(id_diff(5, 3), 2);
        assert_eq!(id_diff(1, 65535), 2);
        assert_eq!(id_diff(0, 0), 0);
    }
}
