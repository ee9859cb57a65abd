use nalgebra::{DMatrix, DVector};

use crate::traits::DrivenSystem;

/// Classic Runge-Kutta 4th Order stepper for driven systems.
///
/// The drive is sampled once per RK stage, so a step consumes a `k x 4`
/// block of drive columns rather than a single input vector. Buffers are
/// preallocated and reused across steps.
pub struct Rk4 {
    k1: DVector<f64>,
    k2: DVector<f64>,
    k3: DVector<f64>,
    k4: DVector<f64>,
    tmp: DVector<f64>,
    xbuf: DVector<f64>,
}

impl Rk4 {
    pub fn new(dim: usize, drive_dim: usize) -> Self {
        Self {
            k1: DVector::zeros(dim),
            k2: DVector::zeros(dim),
            k3: DVector::zeros(dim),
            k4: DVector::zeros(dim),
            tmp: DVector::zeros(dim),
            xbuf: DVector::zeros(drive_dim),
        }
    }

    /// Advances `state` by one step of size `dt`. `drive` holds one column
    /// per RK stage (stages at t, t+dt/2, t+dt/2, t+dt).
    pub fn step(
        &mut self,
        system: &impl DrivenSystem,
        state: &mut DVector<f64>,
        drive: &DMatrix<f64>,
        dt: f64,
    ) {
        // k1 = f(r, x0)
        self.xbuf.copy_from(&drive.column(0));
        system.deriv(state, &self.xbuf, &mut self.k1);

        // k2 = f(r + dt*k1/2, x1)
        self.tmp.copy_from(state);
        self.tmp.axpy(dt * 0.5, &self.k1, 1.0);
        self.xbuf.copy_from(&drive.column(1));
        system.deriv(&self.tmp, &self.xbuf, &mut self.k2);

        // k3 = f(r + dt*k2/2, x2)
        self.tmp.copy_from(state);
        self.tmp.axpy(dt * 0.5, &self.k2, 1.0);
        self.xbuf.copy_from(&drive.column(2));
        system.deriv(&self.tmp, &self.xbuf, &mut self.k3);

        // k4 = f(r + dt*k3, x3)
        self.tmp.copy_from(state);
        self.tmp.axpy(dt, &self.k3, 1.0);
        self.xbuf.copy_from(&drive.column(3));
        system.deriv(&self.tmp, &self.xbuf, &mut self.k4);

        // r_next = r + dt/6 * (k1 + 2k2 + 2k3 + k4)
        state.axpy(dt / 6.0, &self.k1, 1.0);
        state.axpy(dt / 3.0, &self.k2, 1.0);
        state.axpy(dt / 3.0, &self.k3, 1.0);
        state.axpy(dt / 6.0, &self.k4, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::Rk4;
    use crate::traits::DrivenSystem;
    use nalgebra::{DMatrix, DVector};

    /// dr/dt = rate * r, ignoring the drive.
    struct LinearSystem {
        rate: f64,
    }

    impl DrivenSystem for LinearSystem {
        fn dimension(&self) -> usize {
            1
        }

        fn drive_dimension(&self) -> usize {
            1
        }

        fn deriv(&self, r: &DVector<f64>, _x: &DVector<f64>, out: &mut DVector<f64>) {
            out[0] = self.rate * r[0];
        }
    }

    /// dr/dt = x, integrating the drive directly.
    struct DriveIntegrator;

    impl DrivenSystem for DriveIntegrator {
        fn dimension(&self) -> usize {
            1
        }

        fn drive_dimension(&self) -> usize {
            1
        }

        fn deriv(&self, _r: &DVector<f64>, x: &DVector<f64>, out: &mut DVector<f64>) {
            out[0] = x[0];
        }
    }

    #[test]
    fn step_matches_exponential_decay() {
        let system = LinearSystem { rate: -1.0 };
        let mut stepper = Rk4::new(1, 1);
        let mut state = DVector::from_element(1, 1.0);
        let drive = DMatrix::zeros(1, 4);

        let dt = 0.01;
        for _ in 0..100 {
            stepper.step(&system, &mut state, &drive, dt);
        }

        let expected = (-1.0f64).exp();
        assert!((state[0] - expected).abs() < 1e-9);
    }

    #[test]
    fn stage_samples_are_consumed_in_order() {
        // With f = x, one step yields dt/6 * (x0 + 2x1 + 2x2 + x3).
        let mut stepper = Rk4::new(1, 1);
        let mut state = DVector::zeros(1);
        let drive = DMatrix::from_row_slice(1, 4, &[6.0, 12.0, 18.0, 24.0]);

        stepper.step(&DriveIntegrator, &mut state, &drive, 1.0);

        let expected = (6.0 + 2.0 * 12.0 + 2.0 * 18.0 + 24.0) / 6.0;
        assert!((state[0] - expected).abs() < 1e-12);
    }
}
