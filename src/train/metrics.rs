/// Fraction of `predicted` labels equal to `actual`.
pub fn accuracy(actual: &[u8], predicted: &[u8]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let correct = actual.iter().zip(predicted).filter(|(a, p)| a == p).count();
    correct as f64 / actual.len() as f64
}

/// Area under the ROC curve for binary `targets` (1 = positive) and `scores`.
///
/// Computed from the Mann-Whitney U statistic with tied scores sharing their average rank.
/// With only one class present the curve is undefined and 0.5 is returned.
pub fn roc_auc(targets: &[u8], scores: &[f32]) -> f64 {
    let positives = targets.iter().filter(|&&t| t == 1).count();
    let negatives = targets.len() - positives;
    if positives == 0 || negatives == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0_f64; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // Ranks are 1-based; ties get the mean of the ranks they span.
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &k in &order[i..=j] {
            ranks[k] = rank;
        }
        i = j + 1;
    }

    let positive_rank_sum: f64 = targets
        .iter()
        .zip(&ranks)
        .filter(|(t, _)| **t == 1)
        .map(|(_, r)| r)
        .sum();
    let p = positives as f64;
    (positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_and_inverted_rankings() {
        let y = [0, 0, 1, 1];
        assert_eq!(roc_auc(&y, &[0.1, 0.2, 0.8, 0.9]), 1.0);
        assert_eq!(roc_auc(&y, &[0.9, 0.8, 0.2, 0.1]), 0.0);
    }

    #[test]
    fn ties_count_half() {
        assert_eq!(roc_auc(&[0, 1], &[0.5, 0.5]), 0.5);
        // One positive above both negatives, one tied with a negative.
        let auc = roc_auc(&[0, 0, 1, 1], &[0.2, 0.6, 0.6, 0.9]);
        assert!((auc - 0.875).abs() < 1e-12);
    }

    #[test]
    fn single_class_is_uninformative() {
        assert_eq!(roc_auc(&[1, 1], &[0.2, 0.9]), 0.5);
    }

    #[test]
    fn accuracy_counts_matches() {
        assert_eq!(accuracy(&[0, 1, 1, 0], &[0, 1, 0, 0]), 0.75);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }
}
