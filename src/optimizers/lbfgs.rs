//! Module for the L-BFGS optimizer.
//!
//! A thin driver over argmin's limited-memory quasi-Newton solver. The L2
//! penalty lives in the objective; the L1 penalty uses the solver's
//! orthant-wise update. Objective failures carried through the executor are
//! unwrapped back into crate errors, so numeric breakdown and line-search
//! exhaustion stay distinguishable.

use argmin::{
    core::{
        observers::{ObserverMode, SlogLogger},
        CostFunction, Executor, Gradient,
    },
    solver::{linesearch::MoreThuenteLineSearch, quasinewton::LBFGS},
};

use crate::errors::{Result, TricrfError};
use crate::trainer::Regularization;

/// Default history length of the limited-memory update.
pub const LBFGS_MEMORY: usize = 100;

/// Sufficient-decrease constant of the strong Wolfe conditions.
const WOLFE_C1: f64 = 1e-4;

/// Curvature constant of the strong Wolfe conditions.
const WOLFE_C2: f64 = 0.9;

/// Step length bounds of the line search.
const STEP_BOUNDS: (f64, f64) = (1e-20, 1e20);

/// Gradient-norm tolerance of the convergence test.
const TOLERANCE_GRAD: f64 = 1e-5;

fn from_argmin(error: argmin::core::Error) -> TricrfError {
    match error.downcast::<TricrfError>() {
        Ok(error) => error,
        Err(error) => TricrfError::optimizer_failed(error.to_string()),
    }
}

/// Minimizes `loss` starting from `weights_init` and returns the final
/// weight vector.
///
/// # Errors
///
/// Returns `NumericBreakdown` when an evaluation reports a non-finite
/// objective or gradient, and `OptimizerFailed` when the line search cannot
/// satisfy the Wolfe conditions.
pub fn optimize<L>(
    loss: L,
    weights_init: Vec<f64>,
    regularization: Regularization,
    l1_c: f64,
    max_iter: u64,
    memory: usize,
) -> Result<Vec<f64>>
where
    L: CostFunction<Param = Vec<f64>, Output = f64>
        + Gradient<Param = Vec<f64>, Gradient = Vec<f64>>,
{
    let linesearch = MoreThuenteLineSearch::new()
        .with_c(WOLFE_C1, WOLFE_C2)
        .map_err(from_argmin)?
        .with_bounds(STEP_BOUNDS.0, STEP_BOUNDS.1)
        .map_err(from_argmin)?;
    let solver = LBFGS::new(linesearch, memory)
        .with_tolerance_grad(TOLERANCE_GRAD)
        .map_err(from_argmin)?;
    let solver = match regularization {
        Regularization::L1 => solver.with_l1_regularization(l1_c).map_err(from_argmin)?,
        Regularization::L2 => solver,
    };
    let res = Executor::new(loss, solver)
        .configure(|state| state.param(weights_init).max_iters(max_iter))
        .add_observer(SlogLogger::term(), ObserverMode::Always)
        .run()
        .map_err(from_argmin)?;
    res.state
        .best_param
        .or(res.state.param)
        .ok_or_else(|| TricrfError::optimizer_failed("no parameter vector produced"))
}
