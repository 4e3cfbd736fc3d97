//! Negative binomial distribution utilities

use statrs::function::gamma::ln_gamma;

/// Floor applied to fitted means before weights and deviance are computed
pub const MIN_MU: f64 = 0.5;

/// Coefficients beyond this magnitude stop IRLS and flag the gene
pub const MAX_LFC_BETA: f64 = 30.0;

/// Linear predictor clamp, exp(700) is still finite
pub const MAX_ETA: f64 = 700.0;

/// Default ridge on each coefficient, 1e-6 on the log2 scale
pub fn default_ridge_lambda() -> f64 {
    let ln2 = std::f64::consts::LN_2;
    1e-6 / (ln2 * ln2)
}

/// mu = size_factor * exp(eta)
pub fn nb_mean(eta: f64, size_factor: f64) -> f64 {
    size_factor * eta.clamp(-MAX_ETA, MAX_ETA).exp()
}

/// Var(Y) = mu + alpha * mu^2
pub fn nb_variance(mu: f64, alpha: f64) -> f64 {
    mu + alpha * mu * mu
}

/// Log-density of a count under NB(mean = mu, size = 1/alpha)
pub fn nb_log_likelihood(y: f64, mu: f64, alpha: f64) -> f64 {
    if mu <= 0.0 || alpha <= 0.0 {
        return f64::NEG_INFINITY;
    }
    let size = 1.0 / alpha;
    let prob = size / (size + mu);
    ln_gamma(y + size) - ln_gamma(size) - ln_gamma(y + 1.0) + size * prob.ln() + y * (1.0 - prob).ln()
}

/// IRLS weight mu / (1 + alpha * mu)
pub fn nb_weight(mu: f64, alpha: f64) -> f64 {
    mu / (1.0 + alpha * mu)
}

/// -2 times the summed log-likelihood
pub fn nb_deviance(counts: &[f64], mu: &[f64], alpha: f64) -> f64 {
    counts
        .iter()
        .zip(mu.iter())
        .map(|(&y, &m)| -2.0 * nb_log_likelihood(y, m, alpha))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_nb_mean_clamps_eta() {
        assert_abs_diff_eq!(nb_mean(2.0, 1.5), 1.5 * 2.0_f64.exp(), epsilon = 1e-10);
        assert!(nb_mean(1e6, 1.0).is_finite());
    }

    #[test]
    fn test_nb_variance() {
        assert_abs_diff_eq!(nb_variance(10.0, 0.1), 20.0, epsilon = 1e-12);
    }

    #[test]
    fn test_nb_log_likelihood_poisson_limit() {
        // small alpha approaches the Poisson log-pmf
        let y = 4.0;
        let mu = 3.0;
        let poisson = y * f64::ln(mu) - mu - ln_gamma(y + 1.0);
        assert_abs_diff_eq!(nb_log_likelihood(y, mu, 1e-8), poisson, epsilon = 1e-5);
        assert_eq!(nb_log_likelihood(1.0, 0.0, 0.1), f64::NEG_INFINITY);
    }

    #[test]
    fn test_nb_log_likelihood_geometric_case() {
        // alpha = 1 is the geometric distribution with p = 1 / (1 + mu)
        let mu: f64 = 2.0;
        let p = 1.0 / (1.0 + mu);
        let expected = p.ln() + 3.0 * (1.0 - p).ln();
        assert_abs_diff_eq!(nb_log_likelihood(3.0, mu, 1.0), expected, epsilon = 1e-10);
    }

    #[test]
    fn test_nb_weight() {
        assert_abs_diff_eq!(nb_weight(10.0, 0.1), 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_deviance_is_minimized_at_observed() {
        let y = [5.0, 12.0, 8.0];
        let good = nb_deviance(&y, &y, 0.1);
        let bad = nb_deviance(&y, &[20.0, 1.0, 30.0], 0.1);
        assert!(good < bad);
    }
}
