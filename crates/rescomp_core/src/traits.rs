use nalgebra::DVector;

/// A continuous-time system driven by an external input vector.
///
/// Unlike an autonomous vector field `f(t, x)`, the systems composed here
/// are time-invariant but input-dependent: the derivative is a function of
/// the latent state and the current drive sample.
pub trait DrivenSystem {
    /// Dimension of the latent state.
    fn dimension(&self) -> usize;

    /// Dimension of the external drive vector.
    fn drive_dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// r: current latent state
    /// x: current drive sample
    /// out: buffer to write dr/dt into
    fn deriv(&self, r: &DVector<f64>, x: &DVector<f64>, out: &mut DVector<f64>);
}
