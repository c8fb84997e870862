use thiserror::Error;

/// Per-call operating mode of the integration loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Step until the internal time passes `tout`, then interpolate.
    Normal,
    /// Take a single internal step and return.
    OneStep,
    /// As `Normal`, but never integrate past the configured stop time.
    NormalTStop,
    /// As `OneStep`, but never integrate past the configured stop time.
    OneStepTStop,
}

impl Task {
    pub(crate) fn uses_tstop(self) -> bool {
        matches!(self, Task::NormalTStop | Task::OneStepTStop)
    }
}

/// Successful return reason of an integration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// Reached `tout` (or completed one step in one-step mode).
    Success,
    /// Reached the configured stop time.
    TStopReached,
}

/// Failures reported by the integration loop. On `TooMuchWork`,
/// `TooMuchAccuracy` and the fatal step failures, the caller's output
/// vectors hold the solution interpolated at the current internal time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    #[error("illegal input: {0}")]
    IllInput(String),
    #[error("{max_steps} internal steps taken before reaching t = {tout}")]
    TooMuchWork { max_steps: usize, tout: f64 },
    #[error(
        "requested accuracy unattainable at t = {t}; scale tolerances by at least {tolsf}"
    )]
    TooMuchAccuracy { t: f64, tolsf: f64 },
    #[error("repeated error test failures at t = {t} with h = {h}")]
    ErrorTestFailure { t: f64, h: f64 },
    #[error("corrector repeatedly failed to converge at t = {t} with h = {h}")]
    ConvergenceFailure { t: f64, h: f64 },
    #[error("linear solver setup failed unrecoverably at t = {t}")]
    LinearSetupFailure { t: f64 },
    #[error("linear solver solve failed unrecoverably at t = {t}")]
    LinearSolveFailure { t: f64 },
    #[error("residual/right-hand-side routine failed unrecoverably at t = {t}")]
    ResidualFailure { t: f64 },
    #[error("residual routine kept failing recoverably at t = {t}")]
    RepeatedResidualError { t: f64 },
    #[error("unable to satisfy inequality constraints at t = {t}")]
    ConstraintFailure { t: f64 },
    #[error("sensitivity difference-quotient evaluation failed at t = {t}")]
    SensDQFailed { t: f64 },
}

/// Failures of the dense-output interface.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterpolationError {
    #[error("t = {t} is outside the last step interval [{tlo}, {thi}]")]
    BadT { t: f64, tlo: f64, thi: f64 },
    #[error("derivative order {k} is outside [0, {kmax}]")]
    BadK { k: usize, kmax: usize },
    #[error("quadrature integration is not enabled")]
    NoQuad,
    #[error("sensitivity analysis is not enabled")]
    NoSens,
    #[error("sensitivity index {index} is outside [0, {ns})")]
    BadSensIndex { index: usize, ns: usize },
}

/// Outcome of a user residual evaluation that did not succeed. A recoverable
/// failure makes the stepper retry with a smaller step; a fatal one aborts
/// the solve.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualError {
    #[error("recoverable residual failure")]
    Recoverable,
    #[error("unrecoverable residual failure")]
    Fatal,
}

/// Outcome of a linear solver setup or solve that did not succeed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverFailure {
    #[error("recoverable linear solver failure")]
    Recoverable,
    #[error("unrecoverable linear solver failure")]
    Fatal,
}
