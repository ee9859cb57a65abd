use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{Error, Result};
use crate::solvers::Rk4;
use crate::traits::DrivenSystem;

/// A continuous-time nonlinear state-space system,
///
///   dr/dt = gamma * (-r + tanh(A r + B x + d)),
///
/// with a linear readout y = W r. Shapes, with n = latent dim, k = input
/// dim, m = output dim:
///
/// * `a`: n x n recurrent coupling
/// * `b`: n x k input coupling
/// * `w`: m x n readout (absent until solved or supplied)
/// * `d`: n x 1 bias
/// * `r_init`, `r`: n x 1 initial / current latent state
/// * `x_init`: k x 1 reference input, used to derive `d`
///
/// Everything except `r` is structural; `r` is the only field simulation
/// mutates. `used_inputs`/`used_outputs` are transient bookkeeping for the
/// linker and carry no meaning outside a resolution pass.
#[derive(Debug, Clone)]
pub struct Reservoir {
    pub(crate) a: DMatrix<f64>,
    pub(crate) b: DMatrix<f64>,
    pub(crate) w: Option<DMatrix<f64>>,
    pub(crate) d: DVector<f64>,
    pub(crate) r_init: DVector<f64>,
    pub(crate) x_init: DVector<f64>,
    pub(crate) r: DVector<f64>,
    pub(crate) gamma: f64,
    pub(crate) global_timescale: f64,
    pub(crate) input_names: Vec<String>,
    pub(crate) output_names: Vec<String>,
    pub(crate) used_inputs: BTreeSet<usize>,
    pub(crate) used_outputs: BTreeSet<usize>,
}

impl Reservoir {
    /// Builds a reservoir with the bias derived so that `r_init` is a fixed
    /// point under the reference input: `d = atanh(r_init) - A r_init - B x_init`.
    pub fn new(
        a: DMatrix<f64>,
        b: DMatrix<f64>,
        r_init: DVector<f64>,
        x_init: DVector<f64>,
        global_timescale: f64,
        gamma: f64,
    ) -> Result<Self> {
        check_shapes(&a, &b, &r_init, &x_init)?;
        let d = r_init.map(f64::atanh) - &a * &r_init - &b * &x_init;
        Ok(Self::assemble(a, b, d, r_init, x_init, global_timescale, gamma))
    }

    /// Builds a reservoir with an explicitly supplied bias vector.
    pub fn with_bias(
        a: DMatrix<f64>,
        b: DMatrix<f64>,
        d: DVector<f64>,
        r_init: DVector<f64>,
        x_init: DVector<f64>,
        global_timescale: f64,
        gamma: f64,
    ) -> Result<Self> {
        check_shapes(&a, &b, &r_init, &x_init)?;
        if d.len() != a.nrows() {
            return Err(Error::dims("bias length must match the latent dimension", a.nrows(), d.len()));
        }
        Ok(Self::assemble(a, b, d, r_init, x_init, global_timescale, gamma))
    }

    fn assemble(
        a: DMatrix<f64>,
        b: DMatrix<f64>,
        d: DVector<f64>,
        r_init: DVector<f64>,
        x_init: DVector<f64>,
        global_timescale: f64,
        gamma: f64,
    ) -> Self {
        let r = r_init.clone();
        Self {
            a,
            b,
            w: None,
            d,
            r_init,
            x_init,
            r,
            gamma,
            global_timescale,
            input_names: Vec::new(),
            output_names: Vec::new(),
            used_inputs: BTreeSet::new(),
            used_outputs: BTreeSet::new(),
        }
    }

    /// An untrained base reservoir: zero coupling, small random input
    /// weights, random initial state, zero reference input. The generator
    /// is seeded so repeated calls are reproducible.
    pub fn base(
        latent_dim: usize,
        input_dim: usize,
        global_timescale: f64,
        gamma: f64,
    ) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let a = DMatrix::zeros(latent_dim, latent_dim);
        let b = DMatrix::from_fn(latent_dim, input_dim, |_, _| {
            (rng.gen::<f64>() - 0.5) * 0.05
        });
        let r_init = DVector::from_fn(latent_dim, |_, _| rng.gen::<f64>() - 0.5);
        let x_init = DVector::zeros(input_dim);
        let d = r_init.map(f64::atanh) - &b * &x_init;
        Self::assemble(a, b, d, r_init, x_init, global_timescale, gamma)
    }

    /// Structural copy: same matrices and names, fresh current state, empty
    /// used-channel sets. Every consumer of a shared reservoir must take one
    /// of these, since linking mutates the bound copy in place.
    pub fn copy_detached(&self) -> Self {
        let mut copy = self.clone();
        copy.r = copy.r_init.clone();
        copy.used_inputs.clear();
        copy.used_outputs.clear();
        copy
    }

    pub fn latent_dim(&self) -> usize {
        self.a.nrows()
    }

    pub fn input_dim(&self) -> usize {
        self.b.ncols()
    }

    /// Readout rows, or 0 while no readout is attached.
    pub fn output_dim(&self) -> usize {
        self.w.as_ref().map_or(0, DMatrix::nrows)
    }

    pub fn a(&self) -> &DMatrix<f64> {
        &self.a
    }

    pub fn b(&self) -> &DMatrix<f64> {
        &self.b
    }

    pub fn readout(&self) -> Option<&DMatrix<f64>> {
        self.w.as_ref()
    }

    pub fn bias(&self) -> &DVector<f64> {
        &self.d
    }

    pub fn r_init(&self) -> &DVector<f64> {
        &self.r_init
    }

    pub fn x_init(&self) -> &DVector<f64> {
        &self.x_init
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.r
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    pub fn global_timescale(&self) -> f64 {
        self.global_timescale
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Attaches a readout matrix, replacing any existing one.
    pub fn set_readout(&mut self, w: DMatrix<f64>) -> Result<()> {
        if w.ncols() != self.latent_dim() {
            return Err(Error::dims(
                "readout columns must match the latent dimension",
                self.latent_dim(),
                w.ncols(),
            ));
        }
        self.w = Some(w);
        Ok(())
    }

    /// Names the input channels. The list must align with the columns of
    /// `B`; an empty list is accepted for the degenerate inputless state.
    pub fn set_input_names(&mut self, names: Vec<String>) -> Result<()> {
        if !names.is_empty() && names.len() != self.input_dim() {
            return Err(Error::dims(
                "input names must align with B columns",
                self.input_dim(),
                names.len(),
            ));
        }
        self.input_names = names;
        Ok(())
    }

    /// Names the output channels, aligned with the rows of `W`.
    pub fn set_output_names(&mut self, names: Vec<String>) -> Result<()> {
        if !names.is_empty() && names.len() != self.output_dim() {
            return Err(Error::dims(
                "output names must align with W rows",
                self.output_dim(),
                names.len(),
            ));
        }
        self.output_names = names;
        Ok(())
    }

    /// Resets the current state to `r_init`.
    pub fn reset(&mut self) {
        self.r.copy_from(&self.r_init);
    }

    /// Advances the state by one integration step of size
    /// `global_timescale`. `drive` is a `k x 4` block, one column per RK
    /// stage.
    pub fn propagate(&mut self, drive: &DMatrix<f64>) -> Result<()> {
        if drive.nrows() != self.input_dim() || drive.ncols() != 4 {
            return Err(Error::dims(
                "propagate drive must be one column per RK stage",
                self.input_dim() * 4,
                drive.nrows() * drive.ncols(),
            ));
        }
        let mut stepper = Rk4::new(self.latent_dim(), self.input_dim());
        self.step_with(&mut stepper, drive);
        Ok(())
    }

    fn step_with(&mut self, stepper: &mut Rk4, drive: &DMatrix<f64>) {
        let dt = self.global_timescale;
        let mut r = std::mem::replace(&mut self.r, DVector::zeros(0));
        stepper.step(self, &mut r, drive, dt);
        self.r = r;
    }

    /// Simulates and applies a readout. The readout is the explicit
    /// `readout` argument if given, else the instance's `W`.
    ///
    /// * `inputs`: a `k x T` matrix (one column per step, held constant
    ///   across the four RK sub-steps), or `k x 4T` when `time` is also
    ///   given (caller-supplied sub-step resolution).
    /// * With `inputs` omitted, `time` is required and the reservoir must be
    ///   inputless: `B` entirely zero with a single zero reference entry.
    ///
    /// Returns the `m x T` readout trajectory.
    pub fn run(
        &mut self,
        inputs: Option<&DMatrix<f64>>,
        time: Option<usize>,
        readout: Option<&DMatrix<f64>>,
    ) -> Result<DMatrix<f64>> {
        let w = match readout {
            Some(w) => w.clone(),
            None => self.w.clone().ok_or(Error::MissingReadout)?,
        };
        if w.ncols() != self.latent_dim() {
            return Err(Error::dims(
                "readout columns must match the latent dimension",
                self.latent_dim(),
                w.ncols(),
            ));
        }
        let states = self.run_states(inputs, time)?;
        Ok(&w * &states)
    }

    /// Simulates and returns the raw `n x T` latent trajectory, recorded
    /// column-by-column starting from the current state.
    pub fn run_states(
        &mut self,
        inputs: Option<&DMatrix<f64>>,
        time: Option<usize>,
    ) -> Result<DMatrix<f64>> {
        enum Drive<'a> {
            PerStep(&'a DMatrix<f64>),
            SubStep(&'a DMatrix<f64>),
            Zero,
        }

        let k = self.input_dim();
        let (steps, drive) = match inputs {
            None => {
                let steps = time.ok_or_else(|| {
                    Error::DimensionMismatch(
                        "running without inputs requires an explicit step count".into(),
                    )
                })?;
                let nonzero = self.b.iter().filter(|v| **v != 0.0).count();
                if nonzero != 0 {
                    return Err(Error::dims(
                        "running without inputs requires an all-zero B",
                        0,
                        nonzero,
                    ));
                }
                let zeros = self.x_init.iter().filter(|v| **v == 0.0).count();
                if zeros != 1 {
                    return Err(Error::dims(
                        "running without inputs requires exactly one zero reference entry",
                        1,
                        zeros,
                    ));
                }
                (steps, Drive::Zero)
            }
            Some(m) => {
                if m.nrows() != k {
                    return Err(Error::dims(
                        "input rows must match the reservoir input dimension",
                        k,
                        m.nrows(),
                    ));
                }
                match time {
                    Some(t) if m.ncols() == 4 * t => (t, Drive::SubStep(m)),
                    Some(t) if m.ncols() == t => (t, Drive::PerStep(m)),
                    Some(t) => {
                        return Err(Error::dims(
                            "input columns must be T or 4T",
                            t,
                            m.ncols(),
                        ))
                    }
                    None => (m.ncols(), Drive::PerStep(m)),
                }
            }
        };
        if steps == 0 {
            return Err(Error::dims("simulation needs at least one step", 1, 0));
        }

        let n = self.latent_dim();
        let mut states = DMatrix::zeros(n, steps);
        states.set_column(0, &self.r);

        let mut stepper = Rk4::new(n, k);
        let mut block = DMatrix::zeros(k, 4);
        for i in 1..steps {
            match &drive {
                Drive::PerStep(m) => {
                    let col = m.column(i - 1);
                    for stage in 0..4 {
                        block.set_column(stage, &col);
                    }
                }
                Drive::SubStep(m) => block.copy_from(&m.columns(4 * (i - 1), 4)),
                Drive::Zero => {}
            }
            self.step_with(&mut stepper, &block);
            states.set_column(i, &self.r);
        }
        Ok(states)
    }
}

impl DrivenSystem for Reservoir {
    fn dimension(&self) -> usize {
        self.latent_dim()
    }

    fn drive_dimension(&self) -> usize {
        self.input_dim()
    }

    fn deriv(&self, r: &DVector<f64>, x: &DVector<f64>, out: &mut DVector<f64>) {
        // dr/dt = gamma * (-r + tanh(A r + B x + d))
        out.copy_from(&self.d);
        out.gemv(1.0, &self.a, r, 1.0);
        out.gemv(1.0, &self.b, x, 1.0);
        out.apply(|v| *v = v.tanh());
        out.axpy(-1.0, r, 1.0);
        *out *= self.gamma;
    }
}

fn check_shapes(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    r_init: &DVector<f64>,
    x_init: &DVector<f64>,
) -> Result<()> {
    if a.nrows() != a.ncols() {
        return Err(Error::dims("A must be square", a.nrows(), a.ncols()));
    }
    if b.nrows() != a.nrows() {
        return Err(Error::dims("B rows must match the latent dimension", a.nrows(), b.nrows()));
    }
    if r_init.len() != a.nrows() {
        return Err(Error::dims("r_init length must match the latent dimension", a.nrows(), r_init.len()));
    }
    if x_init.len() != b.ncols() {
        return Err(Error::dims("x_init length must match B columns", b.ncols(), x_init.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::Reservoir;
    use crate::error::{Error, Result};
    use nalgebra::{DMatrix, DVector};

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn driven_reservoir() -> Reservoir {
        // Small dense system with a nonzero reference input.
        let n = 8;
        let k = 2;
        let a = DMatrix::from_fn(n, n, |i, j| 0.01 * ((i * k + j) as f64).sin());
        let b = DMatrix::from_fn(n, k, |i, j| 0.02 * ((i + 3 * j) as f64).cos());
        let r_init = DVector::from_fn(n, |i, _| 0.4 * ((i as f64) * 0.7).sin());
        let x_init = DVector::from_vec(vec![0.3, -0.2]);
        Reservoir::new(a, b, r_init, x_init, 0.001, 100.0).expect("valid shapes")
    }

    #[test]
    fn derived_bias_satisfies_fixed_point_identity() {
        let res = driven_reservoir();
        // A r0 + B x0 + d == atanh(r0), elementwise.
        let lhs = res.a() * res.r_init() + res.b() * res.x_init() + res.bias();
        let rhs = res.r_init().map(f64::atanh);
        for i in 0..res.latent_dim() {
            assert!((lhs[i] - rhs[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn constant_reference_drive_holds_the_fixed_point() {
        let mut res = driven_reservoir();
        let r0 = res.r_init().clone();
        let drive = DMatrix::from_fn(2, 4, |i, _| res.x_init()[i]);
        for _ in 0..50 {
            res.propagate(&drive).expect("drive block is k x 4");
        }
        for i in 0..res.latent_dim() {
            assert!((res.state()[i] - r0[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn run_rejects_input_row_mismatch() {
        let mut res = driven_reservoir();
        res.set_readout(DMatrix::zeros(1, 8)).expect("readout fits");
        let inputs = DMatrix::zeros(3, 10);
        assert_err_contains(
            res.run(Some(&inputs), None, None),
            "input rows must match",
        );
    }

    #[test]
    fn run_without_readout_is_an_error() {
        let mut res = driven_reservoir();
        let inputs = DMatrix::zeros(2, 10);
        assert_err_contains(res.run(Some(&inputs), None, None), "missing readout");
    }

    #[test]
    fn run_without_inputs_demands_an_inputless_reservoir() {
        let mut res = driven_reservoir();
        res.set_readout(DMatrix::zeros(1, 8)).expect("readout fits");
        assert_err_contains(res.run(None, Some(10), None), "all-zero B");
    }

    #[test]
    fn inputless_reservoir_runs_on_step_count_alone() {
        let n = 4;
        let a = DMatrix::zeros(n, n);
        let b = DMatrix::zeros(n, 1);
        let r_init = DVector::from_element(n, 0.2);
        let x_init = DVector::zeros(1);
        let mut res = Reservoir::new(a, b, r_init, x_init, 0.001, 100.0).expect("valid shapes");
        res.set_readout(DMatrix::from_element(1, n, 1.0)).expect("readout fits");

        let out = res.run(None, Some(25), None).expect("void-input run");
        assert_eq!(out.nrows(), 1);
        assert_eq!(out.ncols(), 25);
    }

    #[test]
    fn substep_resolution_inputs_are_accepted() {
        let mut res = driven_reservoir();
        let steps = 6;
        let fine = DMatrix::from_fn(2, 4 * steps, |i, _| res.x_init()[i]);
        let states = res.run_states(Some(&fine), Some(steps)).expect("4T drive");
        assert_eq!(states.ncols(), steps);
        // Constant reference drive at sub-step resolution also holds r0.
        for i in 0..res.latent_dim() {
            assert!((states[(i, steps - 1)] - res.r_init()[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn trajectory_starts_at_the_current_state() {
        let mut res = driven_reservoir();
        let inputs = DMatrix::zeros(2, 5);
        let states = res.run_states(Some(&inputs), None).expect("zero drive");
        for i in 0..res.latent_dim() {
            assert_eq!(states[(i, 0)], res.r_init()[i]);
        }
    }

    #[test]
    fn base_reservoir_is_reproducible() {
        let first = Reservoir::base(10, 2, 0.001, 100.0);
        let second = Reservoir::base(10, 2, 0.001, 100.0);
        assert_eq!(first.b(), second.b());
        assert_eq!(first.r_init(), second.r_init());
        assert!(first.a().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn copy_detached_resets_state_and_bookkeeping() {
        let mut res = driven_reservoir();
        res.used_inputs.insert(0);
        let drive = DMatrix::zeros(2, 4);
        res.propagate(&drive).expect("drive block is k x 4");

        let copy = res.copy_detached();
        assert_eq!(copy.state(), copy.r_init());
        assert!(copy.used_inputs.is_empty());
        assert_eq!(copy.a(), res.a());
    }

    #[test]
    fn constructor_rejects_inconsistent_shapes() {
        let a = DMatrix::zeros(3, 3);
        let b = DMatrix::zeros(2, 1);
        let r_init = DVector::zeros(3);
        let x_init = DVector::zeros(1);
        let result = Reservoir::new(a, b, r_init, x_init, 0.001, 100.0);
        assert!(matches!(result, Err(Error::DimensionMismatch(_))));
    }
}
