//! Match policy: resolve an observed signature to an enrolled identity.

use crate::index::IdentityIndex;
use crate::types::Signature;

/// Default tolerance for front-facing enrollment/kiosk cameras.
pub const DEFAULT_TOLERANCE: f32 = 0.5;

/// An accepted match.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub identity_id: String,
    /// Euclidean distance to the closest enrolled signature.
    pub distance: f32,
}

/// Strategy for resolving an observed signature against the identity index.
pub trait Matcher {
    fn resolve(
        &self,
        observed: &Signature,
        index: &IdentityIndex,
        tolerance: f32,
    ) -> Option<MatchResult>;
}

/// Nearest-neighbour matcher over raw Euclidean distance.
///
/// Scans every enrolled signature and keeps the first one achieving the
/// minimum distance, so ties resolve to the earliest enrollment.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn resolve(
        &self,
        observed: &Signature,
        index: &IdentityIndex,
        tolerance: f32,
    ) -> Option<MatchResult> {
        if index.is_empty() {
            return None;
        }
        if let Some(expected) = index.dimension() {
            if expected != observed.dimension() {
                tracing::warn!(
                    expected,
                    actual = observed.dimension(),
                    "observed signature dimension does not match index"
                );
                return None;
            }
        }

        let mut best_dist = f32::INFINITY;
        let mut best_id: Option<&str> = None;

        for (identity_id, enrolled) in index.all_signatures() {
            let dist = observed.euclidean_distance(enrolled);
            if dist < best_dist {
                best_dist = dist;
                best_id = Some(identity_id);
            }
        }

        match best_id {
            Some(id) if best_dist <= tolerance => {
                tracing::debug!(identity_id = id, distance = best_dist, "match accepted");
                Some(MatchResult {
                    identity_id: id.to_string(),
                    distance: best_dist,
                })
            }
            _ => {
                tracing::debug!(distance = best_dist, tolerance, "no match within tolerance");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnrolledSignature;
    use chrono::NaiveDate;

    fn sig(values: &[f32]) -> Signature {
        Signature::new(values.to_vec()).unwrap()
    }

    fn index_of(entries: Vec<(&str, Vec<f32>)>) -> IdentityIndex {
        let at = NaiveDate::from_ymd_opt(2024, 1, 8)
            .unwrap()
            .and_hms_opt(6, 30, 0)
            .unwrap();
        IdentityIndex::from_enrolled(
            entries
                .into_iter()
                .map(|(id, v)| EnrolledSignature::new(id, None, sig(&v), at)),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_index_resolves_none() {
        let index = IdentityIndex::new();
        assert_eq!(EuclideanMatcher.resolve(&sig(&[0.0]), &index, 10.0), None);
    }

    #[test]
    fn test_self_match_at_zero_tolerance() {
        let index = index_of(vec![("1001", vec![0.1, 0.2, 0.3]), ("1002", vec![0.9, 0.1, 0.0])]);
        for (id, v) in [("1001", [0.1, 0.2, 0.3]), ("1002", [0.9, 0.1, 0.0])] {
            let result = EuclideanMatcher.resolve(&sig(&v), &index, 0.0).unwrap();
            assert_eq!(result.identity_id, id);
            assert_eq!(result.distance, 0.0);
        }
    }

    #[test]
    fn test_picks_nearest_across_all_signatures() {
        // Best match is the second pose of the second identity.
        let index = index_of(vec![
            ("a", vec![1.0, 0.0]),
            ("b", vec![0.0, 1.0]),
            ("b", vec![0.5, 0.5]),
        ]);
        let result = EuclideanMatcher
            .resolve(&sig(&[0.55, 0.5]), &index, 0.5)
            .unwrap();
        assert_eq!(result.identity_id, "b");
        assert!((result.distance - 0.05).abs() < 1e-5);
    }

    #[test]
    fn test_rejects_beyond_tolerance() {
        let index = index_of(vec![("1001", vec![0.0, 0.0])]);
        assert_eq!(EuclideanMatcher.resolve(&sig(&[0.9, 0.0]), &index, 0.5), None);
    }

    #[test]
    fn test_accepts_at_exact_tolerance() {
        let index = index_of(vec![("1001", vec![0.0])]);
        let result = EuclideanMatcher.resolve(&sig(&[0.5]), &index, 0.5);
        assert_eq!(result.map(|r| r.identity_id).as_deref(), Some("1001"));
    }

    #[test]
    fn test_tie_breaks_by_enrollment_order() {
        let index = index_of(vec![("first", vec![1.0, 0.0]), ("second", vec![-1.0, 0.0])]);
        for _ in 0..5 {
            let result = EuclideanMatcher
                .resolve(&sig(&[0.0, 0.0]), &index, 2.0)
                .unwrap();
            assert_eq!(result.identity_id, "first");
        }
    }

    #[test]
    fn test_tie_breaks_by_signature_not_identity() {
        // "a" was enrolled first, but b's signature predates a's tied one.
        let index = index_of(vec![
            ("a", vec![5.0, 5.0]),
            ("b", vec![1.0, 0.0]),
            ("a", vec![-1.0, 0.0]),
        ]);
        let result = EuclideanMatcher
            .resolve(&sig(&[0.0, 0.0]), &index, 2.0)
            .unwrap();
        assert_eq!(result.identity_id, "b");
        assert_eq!(result.distance, 1.0);
    }

    #[test]
    fn test_tolerance_monotonicity() {
        let index = index_of(vec![("a", vec![0.0, 0.0]), ("b", vec![1.0, 1.0]), ("c", vec![3.0, 0.0])]);
        let probes: Vec<Signature> = (0..20)
            .map(|i| sig(&[i as f32 * 0.2, (i % 4) as f32 * 0.3]))
            .collect();
        let tolerances = [0.0, 0.1, 0.3, 0.5, 0.8, 1.5];

        for pair in tolerances.windows(2) {
            let (t1, t2) = (pair[0], pair[1]);
            for probe in &probes {
                if let Some(r1) = EuclideanMatcher.resolve(probe, &index, t1) {
                    let r2 = EuclideanMatcher.resolve(probe, &index, t2);
                    assert_eq!(r2.map(|r| r.identity_id), Some(r1.identity_id));
                }
            }
        }
    }

    #[test]
    fn test_dimension_mismatch_is_unresolved() {
        let index = index_of(vec![("1001", vec![0.0, 0.0])]);
        assert_eq!(EuclideanMatcher.resolve(&sig(&[0.0]), &index, 1.0), None);
    }
}
