//! some linear algebra functions used throughout the code
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

pub mod band_matrix;
pub mod coupling_matrix;
pub mod dense_matrix;
pub mod gmres;
