use candle_core::Result;

/// KL weights indexed by training epoch
///
/// A linear warm-up from 0 to `target_beta` over `anneal_epochs`,
/// then `target_beta` for `max_epochs + 1` more epochs.
#[derive(Debug, Clone)]
pub struct BetaSchedule {
    values: Vec<f64>,
}

impl BetaSchedule {
    /// * `target_beta` - weight of the KL term after annealing
    /// * `anneal_epochs` - length of the linear warm-up (0: no warm-up)
    /// * `max_epochs` - planned number of training epochs
    pub fn new(target_beta: f64, anneal_epochs: usize, max_epochs: usize) -> Self {
        let mut values = linspace(0., target_beta, anneal_epochs);
        values.extend(std::iter::repeat_n(target_beta, max_epochs + 1));
        Self { values }
    }

    /// same weight at every epoch
    pub fn constant(beta: f64, max_epochs: usize) -> Self {
        Self::new(beta, 0, max_epochs)
    }

    /// KL weight for the given epoch
    pub fn beta(&self, epoch: usize) -> Result<f64> {
        match self.values.get(epoch) {
            Some(&beta) => Ok(beta),
            None => candle_core::bail!(
                "epoch {} is beyond the beta schedule ({} entries)",
                epoch,
                self.values.len()
            ),
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// `num` evenly spaced points over `[start, stop]`, endpoints included
fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            (0..num)
                .map(|i| if i == num - 1 { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn linear_warm_up_then_flat() -> Result<()> {
        let schedule = BetaSchedule::new(2.0, 4, 6);
        let expected = [0.0, 2.0 / 3.0, 4.0 / 3.0, 2.0];
        for (epoch, &beta) in expected.iter().enumerate() {
            assert_abs_diff_eq!(schedule.beta(epoch)?, beta, epsilon = 1e-12);
        }
        for epoch in 4..=7 {
            assert_abs_diff_eq!(schedule.beta(epoch)?, 2.0, epsilon = 1e-12);
        }
        assert_eq!(schedule.len(), 4 + 7);
        Ok(())
    }

    #[test]
    fn no_annealing_is_constant() -> Result<()> {
        let schedule = BetaSchedule::constant(0.5, 3);
        assert_eq!(schedule.values(), &[0.5, 0.5, 0.5, 0.5]);
        Ok(())
    }

    #[test]
    fn single_anneal_epoch_starts_at_zero() -> Result<()> {
        let schedule = BetaSchedule::new(3.0, 1, 2);
        assert_eq!(schedule.values(), &[0.0, 3.0, 3.0, 3.0]);
        Ok(())
    }

    #[test]
    fn epoch_past_the_end_is_an_error() {
        let schedule = BetaSchedule::new(1.0, 2, 2);
        assert!(schedule.beta(schedule.len()).is_err());
    }
}
