//! General rate model of packed-bed chromatography: discretization,
//! binding models, residual/Jacobian, Schur-complement linear solver and
//! consistent initialization.
#![allow(non_snake_case)]

pub mod GRM_initial_conditions;
pub mod GRM_linear_solver;
pub mod GRM_model;
pub mod binding;
pub mod disc;
