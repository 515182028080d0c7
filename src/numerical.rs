//! numerical methods: the BDF integrator for differential-algebraic systems
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

pub mod DAE_BDF;
