use nalgebra::{SMatrix, SVector};

/// State (x, y, vx, vy).
pub type KalmanMean = SVector<f32, 4>;
pub type KalmanCovariance = SMatrix<f32, 4, 4>;
/// Measurement (x, y).
pub type Measurement = SVector<f32, 2>;

/// Constant-velocity Kalman filter over centroid positions.
///
/// Noise scales with the object size passed in, so small and large events
/// get comparable relative uncertainty.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    motion_mat: SMatrix<f32, 4, 4>,
    update_mat: SMatrix<f32, 2, 4>,
    std_weight_position: f32,
    std_weight_velocity: f32,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl KalmanFilter {
    /// Initialize motion and update matrices.
    pub fn new() -> Self {
        let dt = 1.0;
        let mut motion_mat = SMatrix::<f32, 4, 4>::identity();
        motion_mat[(0, 2)] = dt;
        motion_mat[(1, 3)] = dt;
        let update_mat = SMatrix::<f32, 2, 4>::identity();
        KalmanFilter {
            motion_mat,
            update_mat,
            std_weight_position: 1.0 / 20.0,
            std_weight_velocity: 1.0 / 160.0,
        }
    }

    /// Start a track at `measurement` with zero velocity.
    pub fn initiate(&self, measurement: &Measurement, size: f32) -> (KalmanMean, KalmanCovariance) {
        let size = size.max(1.0);
        let mut mean = KalmanMean::zeros();
        mean.fixed_rows_mut::<2>(0).copy_from(measurement);
        let std = KalmanMean::new(
            2.0 * self.std_weight_position * size,
            2.0 * self.std_weight_position * size,
            10.0 * self.std_weight_velocity * size,
            10.0 * self.std_weight_velocity * size,
        );
        (mean, KalmanCovariance::from_diagonal(&std.component_mul(&std)))
    }

    /// Predict step: x' = F x, P' = F P F^T + Q
    pub fn predict(&self, mean: &KalmanMean, covariance: &KalmanCovariance, size: f32) -> (KalmanMean, KalmanCovariance) {
        let size = size.max(1.0);
        let pos = self.std_weight_position * size;
        let vel = self.std_weight_velocity * size;
        let q_vec = KalmanMean::new(pos, pos, vel, vel);
        let q = KalmanCovariance::from_diagonal(&q_vec.component_mul(&q_vec));

        let new_mean = self.motion_mat * mean;
        let new_cov = self.motion_mat * covariance * self.motion_mat.transpose() + q;
        (new_mean, new_cov)
    }

    fn measurement_noise(&self, size: f32) -> SMatrix<f32, 2, 2> {
        let std = self.std_weight_position * size.max(1.0);
        SMatrix::<f32, 2, 2>::from_diagonal_element(std * std)
    }

    /// Project state to measurement space: z = Hx, S = H P H^T + R
    pub fn project(&self, mean: &KalmanMean, covariance: &KalmanCovariance, size: f32) -> (Measurement, SMatrix<f32, 2, 2>) {
        let r = self.measurement_noise(size);
        let z_mean = self.update_mat * mean;
        let s_cov = self.update_mat * covariance * self.update_mat.transpose() + r;
        (z_mean, s_cov)
    }

    /// Squared Mahalanobis distance between the state and each measurement.
    pub fn gating_distance(
        &self,
        mean: &KalmanMean,
        covariance: &KalmanCovariance,
        size: f32,
        measurements: &[Measurement],
    ) -> Vec<f32> {
        let (z_mean, s_cov) = self.project(mean, covariance, size);
        let mut s_regularized = s_cov;
        for i in 0..2 {
            s_regularized[(i, i)] += 1e-6;
        }
        let lu = s_regularized.lu();
        measurements
            .iter()
            .map(|z| {
                let d = z - z_mean;
                match lu.solve(&d) {
                    Some(s_inv_d) => d.dot(&s_inv_d),
                    None => f32::MAX,
                }
            })
            .collect()
    }

    /// Correction step with a position measurement.
    pub fn update(
        &self,
        mean: &KalmanMean,
        covariance: &KalmanCovariance,
        measurement: &Measurement,
        size: f32,
    ) -> (KalmanMean, KalmanCovariance) {
        let (projected_mean, projected_cov) = self.project(mean, covariance, size);
        let pht = covariance * self.update_mat.transpose();

        let mut s_regularized = projected_cov;
        for i in 0..2 {
            s_regularized[(i, i)] += 1e-6;
        }

        // K = P H^T S^-1, solved as S K^T = (P H^T)^T
        let k = match s_regularized.lu().solve(&pht.transpose()) {
            Some(k_t) => k_t.transpose(),
            None => return (*mean, *covariance),
        };

        let innovation = measurement - projected_mean;
        let new_mean = mean + k * innovation;
        // Joseph form keeps the covariance symmetric positive definite.
        let i_kh = KalmanCovariance::identity() - k * self.update_mat;
        let new_cov = i_kh * covariance * i_kh.transpose() + k * self.measurement_noise(size) * k.transpose();
        (new_mean, new_cov)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_kalman_filter_initialization() {
        let kf = KalmanFilter::new();
        let (mean, covariance) = kf.initiate(&Measurement::new(10.0, 20.0), 8.0);

        assert_relative_eq!(mean[0], 10.0);
        assert_relative_eq!(mean[1], 20.0);
        assert_relative_eq!(mean[2], 0.0);
        assert_relative_eq!(mean[3], 0.0);

        for i in 0..4 {
            for j in 0..4 {
                if i == j {
                    assert!(covariance[(i, j)] > 0.0);
                } else {
                    assert_eq!(covariance[(i, j)], 0.0);
                }
            }
        }
    }

    #[test]
    fn test_kalman_predict() {
        let kf = KalmanFilter::new();
        let mean = KalmanMean::new(100.0, 100.0, 10.0, 5.0);
        let (_, covariance) = kf.initiate(&Measurement::new(100.0, 100.0), 10.0);

        let (pred_mean, pred_cov) = kf.predict(&mean, &covariance, 10.0);
        assert_relative_eq!(pred_mean[0], 110.0);
        assert_relative_eq!(pred_mean[1], 105.0);
        assert_relative_eq!(pred_mean[2], 10.0);
        assert_relative_eq!(pred_mean[3], 5.0);

        // Covariance should grow
        assert!(pred_cov[(0, 0)] > covariance[(0, 0)]);
    }

    #[test]
    fn test_kalman_update() {
        let kf = KalmanFilter::new();
        let (mean, covariance) = kf.initiate(&Measurement::new(100.0, 100.0), 10.0);
        let (mean, covariance) = kf.predict(&mean, &covariance, 10.0);

        let measurement = Measurement::new(104.0, 102.0);
        let (new_mean, new_cov) = kf.update(&mean, &covariance, &measurement, 10.0);

        // State should be somewhere between prediction and measurement
        assert!(new_mean[0] > 100.0 && new_mean[0] < 104.0);
        assert!(new_mean[1] > 100.0 && new_mean[1] < 102.0);
        // Velocity picks up the direction of motion
        assert!(new_mean[2] > 0.0);

        // Covariance should decrease after measurement update
        assert!(new_cov[(0, 0)] < covariance[(0, 0)]);
    }

    #[test]
    fn test_gating_distance_orders_measurements() {
        let kf = KalmanFilter::new();
        let (mean, covariance) = kf.initiate(&Measurement::new(50.0, 50.0), 10.0);
        let d = kf.gating_distance(
            &mean,
            &covariance,
            10.0,
            &[Measurement::new(50.5, 50.0), Measurement::new(90.0, 50.0)],
        );
        assert!(d[0] < 1.0);
        assert!(d[1] > d[0] * 100.0);
    }
}
