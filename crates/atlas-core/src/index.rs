//! In-memory identity index: every enrolled face signature and its owner.

use crate::types::{EnrolledSignature, IdentityRecord, Signature};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("identity not enrolled: {0}")]
    NotFound(String),
    #[error("signature has {actual} dimensions, index holds {expected}-dimensional signatures")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Every enrolled signature, in global enrollment order.
///
/// Signatures of different identities interleave exactly as they were
/// enrolled; [`all_signatures`](Self::all_signatures) walks them in that
/// order, which is what makes match tie-breaking stable.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    signatures: Vec<EnrolledSignature>,
    /// Identity IDs in order of first enrollment.
    identities: Vec<String>,
    counts: HashMap<String, usize>,
    /// Dimension shared by every enrolled signature; `None` while empty.
    dimension: Option<usize>,
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an index from persisted signatures, in the order given.
    pub fn from_enrolled<I>(enrolled: I) -> Result<Self, IndexError>
    where
        I: IntoIterator<Item = EnrolledSignature>,
    {
        let mut index = Self::new();
        for signature in enrolled {
            index.enroll(signature)?;
        }
        Ok(index)
    }

    /// Check that `signature` could be enrolled without mutating anything.
    pub fn check_dimension(&self, signature: &Signature) -> Result<(), IndexError> {
        match self.dimension {
            Some(expected) if expected != signature.dimension() => {
                Err(IndexError::DimensionMismatch {
                    expected,
                    actual: signature.dimension(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Append a signature, registering its identity if absent.
    pub fn enroll(&mut self, enrolled: EnrolledSignature) -> Result<(), IndexError> {
        self.check_dimension(&enrolled.signature)?;
        self.dimension = Some(enrolled.signature.dimension());

        let count = self.counts.entry(enrolled.identity_id.clone()).or_insert(0);
        if *count == 0 {
            self.identities.push(enrolled.identity_id.clone());
        }
        *count += 1;
        self.signatures.push(enrolled);
        Ok(())
    }

    /// Remove an identity and every signature enrolled for it.
    pub fn remove(&mut self, identity_id: &str) -> Result<IdentityRecord, IndexError> {
        if self.counts.remove(identity_id).is_none() {
            return Err(IndexError::NotFound(identity_id.to_string()));
        }

        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.signatures)
            .into_iter()
            .partition(|s| s.identity_id == identity_id);
        self.signatures = kept;
        self.identities.retain(|id| id != identity_id);
        if self.signatures.is_empty() {
            self.dimension = None;
        }

        Ok(IdentityRecord {
            identity_id: identity_id.to_string(),
            signatures: removed,
        })
    }

    /// Flattened `(identity_id, signature)` view in enrollment order.
    pub fn all_signatures(&self) -> impl Iterator<Item = (&str, &Signature)> + '_ {
        self.signatures
            .iter()
            .map(|s| (s.identity_id.as_str(), &s.signature))
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Number of enrolled identities.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn signature_count_for(&self, identity_id: &str) -> usize {
        self.counts.get(identity_id).copied().unwrap_or(0)
    }

    pub fn contains(&self, identity_id: &str) -> bool {
        self.counts.contains_key(identity_id)
    }

    /// Enrolled identity IDs in order of first enrollment.
    pub fn identities(&self) -> Vec<String> {
        self.identities.clone()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn enrolled(id: &str, values: &[f32]) -> EnrolledSignature {
        let at = NaiveDate::from_ymd_opt(2024, 1, 8)
            .unwrap()
            .and_hms_opt(6, 30, 0)
            .unwrap();
        EnrolledSignature::new(id, None, Signature::new(values.to_vec()).unwrap(), at)
    }

    #[test]
    fn test_new_index_is_empty() {
        let index = IdentityIndex::new();
        assert!(index.is_empty());
        assert_eq!(index.all_signatures().count(), 0);
        assert_eq!(index.dimension(), None);
    }

    #[test]
    fn test_enroll_creates_and_appends() {
        let mut index = IdentityIndex::new();
        index.enroll(enrolled("1001", &[0.0, 1.0])).unwrap();
        index.enroll(enrolled("1001", &[0.0, 1.0])).unwrap();
        index.enroll(enrolled("1002", &[1.0, 0.0])).unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.signature_count(), 3);
        assert_eq!(index.signature_count_for("1001"), 2);
        assert_eq!(index.dimension(), Some(2));
    }

    #[test]
    fn test_all_signatures_in_enrollment_order() {
        let mut index = IdentityIndex::new();
        index.enroll(enrolled("b", &[1.0])).unwrap();
        index.enroll(enrolled("a", &[2.0])).unwrap();
        index.enroll(enrolled("b", &[3.0])).unwrap();

        let flat: Vec<(&str, f32)> = index
            .all_signatures()
            .map(|(id, s)| (id, s.values()[0]))
            .collect();
        assert_eq!(flat, vec![("b", 1.0), ("a", 2.0), ("b", 3.0)]);
        assert_eq!(index.identities(), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_enroll_rejects_dimension_mismatch() {
        let mut index = IdentityIndex::new();
        index.enroll(enrolled("1001", &[0.0, 1.0])).unwrap();
        let err = index.enroll(enrolled("1002", &[0.0, 1.0, 2.0])).unwrap_err();
        assert_eq!(
            err,
            IndexError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        );
        assert!(!index.contains("1002"));
    }

    #[test]
    fn test_remove_twice_is_not_found() {
        let mut index = IdentityIndex::new();
        index.enroll(enrolled("1001", &[0.5])).unwrap();
        index.enroll(enrolled("1001", &[0.6])).unwrap();

        let record = index.remove("1001").unwrap();
        assert_eq!(record.signatures.len(), 2);
        assert_eq!(index.all_signatures().count(), 0);
        assert_eq!(
            index.remove("1001"),
            Err(IndexError::NotFound("1001".into()))
        );
    }

    #[test]
    fn test_remove_keeps_other_positions() {
        let mut index = IdentityIndex::new();
        index.enroll(enrolled("a", &[1.0])).unwrap();
        index.enroll(enrolled("b", &[2.0])).unwrap();
        index.enroll(enrolled("c", &[3.0])).unwrap();

        index.remove("a").unwrap();
        let c: Vec<_> = index.all_signatures().filter(|(id, _)| *id == "c").collect();
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].1.values(), &[3.0]);
        index.enroll(enrolled("b", &[4.0])).unwrap();
        assert_eq!(index.signature_count_for("b"), 2);
        assert_eq!(index.identities(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_removing_last_identity_resets_dimension() {
        let mut index = IdentityIndex::new();
        index.enroll(enrolled("a", &[1.0, 2.0])).unwrap();
        index.remove("a").unwrap();
        index.enroll(enrolled("b", &[1.0, 2.0, 3.0])).unwrap();
        assert_eq!(index.dimension(), Some(3));
    }

    #[test]
    fn test_from_enrolled() {
        let index =
            IdentityIndex::from_enrolled(vec![enrolled("a", &[1.0]), enrolled("b", &[2.0])])
                .unwrap();
        assert_eq!(index.identities(), vec!["a".to_string(), "b".to_string()]);
    }
}
