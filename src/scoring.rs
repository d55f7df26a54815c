use serde::{Deserialize, Serialize};

use crate::{BowVector, LNorm, WordValue};

/// Log of the smallest weight considered nonzero. Penalty applied by the
/// KL metric to words missing from the second vector.
const LOG_EPS: WordValue = -36.04365338911715; // ln(f64::EPSILON)

/// Similarity metric between two bag-of-words vectors.
///
/// Every metric is computed over the words present in both vectors only,
/// so vectors sharing no word score 0 and a score never touches the full
/// vocabulary dimension.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoringType {
    /// `1 - 0.5 * |v - w|_1` over L1-normalized vectors, in `[0, 1]`.
    #[default]
    L1Norm,
    /// `1 - sqrt(1 - <v, w>)` over L2-normalized vectors, in `[0, 1]`.
    L2Norm,
    /// `2 * sum(v_i * w_i / (v_i + w_i))` over L1-normalized vectors, in `[0, 1]`.
    ChiSquare,
    /// Negated KL divergence of `w` from `v`. Maximum 0, asymmetric.
    Kl,
    /// `sum(sqrt(v_i * w_i))` over L1-normalized vectors, in `[0, 1]`.
    Bhattacharyya,
    /// Unnormalized `<v, w>`.
    DotProduct,
}

impl ScoringType {
    /// Norm the vectors must have before being scored with this metric.
    pub fn norm(&self) -> Option<LNorm> {
        match self {
            ScoringType::L2Norm => Some(LNorm::L2),
            ScoringType::DotProduct => None,
            _ => Some(LNorm::L1),
        }
    }

    /// Similarity of `a` with respect to `b`, in `O(|a| + |b|)`.
    pub fn score(&self, a: &BowVector, b: &BowVector) -> WordValue {
        if a.is_empty() || b.is_empty() {
            return 0.;
        }
        let scorer = self.scorer(a);
        let sum = a.common(b).map(|(x, y)| scorer.contribution(x, y)).sum();
        scorer.finish(sum)
    }

    /// Incremental scorer for `query`, used when the shared words of each
    /// candidate are visited one posting at a time.
    pub(crate) fn scorer(&self, query: &BowVector) -> Scorer {
        let penalty = match self {
            ScoringType::Kl => query.iter().map(|(_, v)| v * (v.ln() - LOG_EPS)).sum(),
            _ => 0.,
        };
        Scorer {
            kind: *self,
            penalty,
        }
    }
}

/// Splits a score into a sum of per-shared-word contributions and a final
/// mapping of that sum.
pub(crate) struct Scorer {
    kind: ScoringType,
    penalty: WordValue,
}

impl Scorer {
    #[inline]
    pub(crate) fn contribution(&self, q: WordValue, d: WordValue) -> WordValue {
        match self.kind {
            ScoringType::L1Norm => 0.5 * (q.abs() + d.abs() - (q - d).abs()),
            ScoringType::L2Norm | ScoringType::DotProduct => q * d,
            ScoringType::ChiSquare => q * d / (q + d),
            // swaps the missing-word penalty of `q` for its real divergence term
            ScoringType::Kl => q * (LOG_EPS - d.ln()),
            ScoringType::Bhattacharyya => (q * d).sqrt(),
        }
    }

    #[inline]
    pub(crate) fn finish(&self, sum: WordValue) -> WordValue {
        match self.kind {
            ScoringType::L2Norm => {
                if sum >= 1. {
                    1.
                } else {
                    1. - (1. - sum).sqrt()
                }
            }
            ScoringType::ChiSquare => 2. * sum,
            ScoringType::Kl => -(self.penalty + sum),
            _ => sum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WordId;

    const ALL: [ScoringType; 6] = [
        ScoringType::L1Norm,
        ScoringType::L2Norm,
        ScoringType::ChiSquare,
        ScoringType::Kl,
        ScoringType::Bhattacharyya,
        ScoringType::DotProduct,
    ];

    fn normalized(entries: &[(WordId, WordValue)], scoring: ScoringType) -> BowVector {
        let mut v: BowVector = entries.iter().copied().collect();
        if let Some(n) = scoring.norm() {
            v.normalize(n);
        }
        v
    }

    #[test]
    fn self_score_is_maximum() {
        let raw = [(0, 2.), (3, 1.), (8, 5.)];
        for s in ALL {
            let v = normalized(&raw, s);
            let expected = match s {
                ScoringType::Kl => 0.,
                ScoringType::DotProduct => 4. + 1. + 25.,
                _ => 1.,
            };
            assert!((s.score(&v, &v) - expected).abs() < 1e-6, "{:?}", s);
        }
    }

    #[test]
    fn empty_and_disjoint_score_zero() {
        for s in ALL {
            let v = normalized(&[(0, 1.), (1, 1.)], s);
            let w = normalized(&[(2, 1.), (3, 1.)], s);
            assert_eq!(s.score(&v, &BowVector::new()), 0., "{:?}", s);
            assert_eq!(s.score(&BowVector::new(), &v), 0., "{:?}", s);
            if s != ScoringType::Kl {
                assert_eq!(s.score(&v, &w), 0., "{:?}", s);
            }
        }
    }

    #[test]
    fn l1_matches_closed_form() {
        let v = normalized(&[(0, 1.), (1, 1.)], ScoringType::L1Norm);
        let w = normalized(&[(1, 1.), (2, 3.)], ScoringType::L1Norm);
        // |0.5 - 0| + |0.5 - 0.25| + |0 - 0.75| = 1.5
        let s = ScoringType::L1Norm.score(&v, &w);
        assert!((s - (1. - 0.5 * 1.5)).abs() < 1e-12);
        assert!((ScoringType::L1Norm.score(&w, &v) - s).abs() < 1e-12);
    }

    #[test]
    fn chi_square_and_l2_known_values() {
        let v = normalized(&[(0, 1.), (1, 1.)], ScoringType::ChiSquare);
        let w = normalized(&[(1, 1.), (2, 1.)], ScoringType::ChiSquare);
        // 2 * (0.25 / 1.0)
        assert!((ScoringType::ChiSquare.score(&v, &w) - 0.5).abs() < 1e-12);

        let v = normalized(&[(0, 1.), (1, 1.)], ScoringType::L2Norm);
        let w = normalized(&[(1, 1.), (2, 1.)], ScoringType::L2Norm);
        let s = ScoringType::L2Norm.score(&v, &w);
        assert!((s - (1. - 0.5f64.sqrt())).abs() < 1e-12);
        assert!(s > 0. && s < 1.);
    }

    #[test]
    fn kl_is_asymmetric_and_penalizes_missing_words() {
        let v = normalized(&[(0, 1.), (1, 1.)], ScoringType::Kl);
        let w = normalized(&[(0, 3.), (1, 1.), (2, 4.)], ScoringType::Kl);
        let vw = ScoringType::Kl.score(&v, &w);
        let wv = ScoringType::Kl.score(&w, &v);
        assert!(vw < 0. && wv < 0.);
        assert!((vw - wv).abs() > 1e-6);
        // w has a word v lacks: bounded but large penalty
        assert!(wv.is_finite() && wv < vw);
    }
}
