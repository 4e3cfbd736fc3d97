//! Small dense linear algebra on row-major `Vec<f64>` buffers
//!
//! Per-gene systems have one row per coefficient, so these stay flat and
//! allocation-light rather than going through `Array2`.

use ndarray::Array2;

/// X' diag(w) X as an `n_coefs x n_coefs` row-major buffer
pub fn weighted_gram(design: &Array2<f64>, weights: &[f64]) -> Vec<f64> {
    let p = design.ncols();
    let mut xtwx = vec![0.0; p * p];
    for (i, &w) in weights.iter().enumerate() {
        for j in 0..p {
            let xij = w * design[[i, j]];
            for k in 0..p {
                xtwx[j * p + k] += xij * design[[i, k]];
            }
        }
    }
    xtwx
}

/// X' diag(w) z
pub fn weighted_cross(design: &Array2<f64>, weights: &[f64], z: &[f64]) -> Vec<f64> {
    let p = design.ncols();
    let mut xtwz = vec![0.0; p];
    for (i, (&w, &zi)) in weights.iter().zip(z.iter()).enumerate() {
        for (j, acc) in xtwz.iter_mut().enumerate() {
            *acc += w * design[[i, j]] * zi;
        }
    }
    xtwz
}

/// Lower Cholesky factor. Non-positive pivots are replaced by a tiny value so
/// a nearly singular system still yields a finite answer.
fn cholesky(a: &[f64], n: usize) -> Vec<f64> {
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                l[i * n + j] = if sum > 0.0 { sum.sqrt() } else { 1e-12_f64.sqrt() };
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }
    l
}

/// Solve `a x = b` for symmetric positive definite `a`
pub fn solve_symmetric(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let l = cholesky(a, n);

    let mut y = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[i * n + j] * y[j];
        }
        y[i] = sum / l[i * n + i];
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = y[i];
        for j in (i + 1)..n {
            sum -= l[j * n + i] * x[j];
        }
        x[i] = sum / l[i * n + i];
    }
    x
}

/// Inverse of a symmetric positive definite matrix
pub fn invert_symmetric(a: &[f64], n: usize) -> Vec<f64> {
    let mut inv = vec![0.0; n * n];
    let mut e = vec![0.0; n];
    for i in 0..n {
        e.iter_mut().for_each(|v| *v = 0.0);
        e[i] = 1.0;
        let col = solve_symmetric(a, &e, n);
        for j in 0..n {
            inv[j * n + i] = col[j];
        }
    }
    inv
}

/// log det of a symmetric positive definite matrix, `None` if not positive definite
pub fn log_det_symmetric(a: &[f64], n: usize) -> Option<f64> {
    let mut l = vec![0.0; n * n];
    let mut log_det = 0.0;
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                l[i * n + j] = sum.sqrt();
                log_det += sum.ln();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }
    Some(log_det)
}

/// Row-major product of two square matrices
pub fn matmul(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let mut c = vec![0.0; n * n];
    for i in 0..n {
        for k in 0..n {
            let aik = a[i * n + k];
            for j in 0..n {
                c[i * n + j] += aik * b[k * n + j];
            }
        }
    }
    c
}

/// c' A c
pub fn quad_form(a: &[f64], c: &[f64]) -> f64 {
    let n = c.len();
    let mut total = 0.0;
    for i in 0..n {
        for j in 0..n {
            total += c[i] * a[i * n + j] * c[j];
        }
    }
    total
}

/// Least-squares fitted values X (X'X)^-1 X' y
pub fn least_squares_fitted(design: &Array2<f64>, y: &[f64]) -> Vec<f64> {
    let p = design.ncols();
    let ones = vec![1.0; design.nrows()];
    let xtx = weighted_gram(design, &ones);
    let xty = weighted_cross(design, &ones, y);
    let beta = solve_symmetric(&xtx, &xty, p);
    (0..design.nrows())
        .map(|i| (0..p).map(|j| design[[i, j]] * beta[j]).sum())
        .collect()
}

/// Numerical column rank via modified Gram-Schmidt with a relative tolerance
pub fn column_rank(matrix: &Array2<f64>) -> usize {
    let (nrow, ncol) = matrix.dim();
    let scale = matrix.iter().fold(0.0_f64, |m, v| m.max(v.abs())).max(1.0);
    let tol = (nrow.max(ncol) as f64) * f64::EPSILON * 1e3 * scale;

    let mut basis: Vec<Vec<f64>> = Vec::new();
    for j in 0..ncol {
        let mut v: Vec<f64> = matrix.column(j).to_vec();
        for q in &basis {
            let proj: f64 = v.iter().zip(q.iter()).map(|(a, b)| a * b).sum();
            v.iter_mut().zip(q.iter()).for_each(|(vi, qi)| *vi -= proj * qi);
        }
        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > tol {
            basis.push(v.into_iter().map(|x| x / norm).collect());
        }
    }
    basis.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_solve_and_invert() {
        let a = vec![4.0, 2.0, 2.0, 3.0];
        let x = solve_symmetric(&a, &[2.0, 1.0], 2);
        assert_abs_diff_eq!(4.0 * x[0] + 2.0 * x[1], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(2.0 * x[0] + 3.0 * x[1], 1.0, epsilon = 1e-12);

        let inv = invert_symmetric(&a, 2);
        let id = matmul(&a, &inv, 2);
        assert_abs_diff_eq!(id[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(id[1], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(id[3], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_log_det() {
        let a = vec![4.0, 2.0, 2.0, 3.0];
        assert_abs_diff_eq!(log_det_symmetric(&a, 2).unwrap(), 8.0_f64.ln(), epsilon = 1e-12);
        assert!(log_det_symmetric(&[1.0, 2.0, 2.0, 1.0], 2).is_none());
    }

    #[test]
    fn test_weighted_gram_and_quad_form() {
        let x = array![[1.0, 0.0], [1.0, 1.0], [1.0, 1.0]];
        let g = weighted_gram(&x, &[1.0, 2.0, 3.0]);
        assert_eq!(g, vec![6.0, 5.0, 5.0, 5.0]);
        assert_abs_diff_eq!(quad_form(&g, &[0.0, 1.0]), 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_least_squares_group_means() {
        let x = array![[1.0, 0.0], [1.0, 0.0], [1.0, 1.0], [1.0, 1.0]];
        let fitted = least_squares_fitted(&x, &[2.0, 4.0, 10.0, 20.0]);
        assert_abs_diff_eq!(fitted[0], 3.0, epsilon = 1e-10);
        assert_abs_diff_eq!(fitted[3], 15.0, epsilon = 1e-10);
    }

    #[test]
    fn test_column_rank() {
        let full = array![[1.0, 0.0], [1.0, 1.0], [1.0, 0.0]];
        assert_eq!(column_rank(&full), 2);
        let deficient = array![[1.0, 2.0], [1.0, 2.0], [1.0, 2.0]];
        assert_eq!(column_rank(&deficient), 1);
    }
}
