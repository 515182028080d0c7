// Copyright (c)  by Gleb E. Zaslavkiy
//MIT License
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
pub mod GRM;
pub mod Utils;
pub mod autodiff;
pub mod global;
pub mod numerical;
pub mod simulator;
pub mod somelinalg;
