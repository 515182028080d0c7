/// SOLVER OF STIFF DAE SYSTEMS F(t, y, y') = 0
/// variable-order BDF with a model-owned block linear solver
pub mod DAE_solver;
/// some utilities for the DAE solver (tolerances, norms, step selection)
pub mod common;
