//! Parameter addressing and the hierarchical parameter provider.
//!
//! Every model parameter is addressable by a `(name, unit, component,
//! bound state, section)` tuple with sentinel values for "any"; the same
//! tuples are used to declare forward sensitivities. Configuration is read
//! through the `ParameterProvider` trait, a hierarchical key-value source
//! with named scopes; `InMemoryParameterProvider` is the map-backed
//! implementation used by the tests and by embedding code.

use std::collections::HashMap;

use crate::global::SimulatorError;

/// Sentinel for "applies to any index" in a [`ParameterId`].
pub const ANY_INDEX: usize = usize::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParameterId {
    pub name: String,
    pub unit: usize,
    pub component: usize,
    pub bound_state: usize,
    pub section: usize,
}

impl ParameterId {
    pub fn new(name: &str) -> Self {
        ParameterId {
            name: name.to_string(),
            unit: ANY_INDEX,
            component: ANY_INDEX,
            bound_state: ANY_INDEX,
            section: ANY_INDEX,
        }
    }

    pub fn with_component(mut self, comp: usize) -> Self {
        self.component = comp;
        self
    }

    pub fn with_section(mut self, sec: usize) -> Self {
        self.section = sec;
        self
    }

    pub fn with_bound_state(mut self, bnd: usize) -> Self {
        self.bound_state = bnd;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Double(f64),
    Int(i64),
    Bool(bool),
    Str(String),
    DoubleArray(Vec<f64>),
}

pub trait ParameterProvider {
    fn exists(&self, name: &str) -> bool;
    fn get_double(&self, name: &str) -> Result<f64, SimulatorError>;
    fn get_int(&self, name: &str) -> Result<i64, SimulatorError>;
    fn get_bool(&self, name: &str) -> Result<bool, SimulatorError>;
    fn get_string(&self, name: &str) -> Result<String, SimulatorError>;
    fn get_double_array(&self, name: &str) -> Result<Vec<f64>, SimulatorError>;
    fn push_scope(&mut self, name: &str) -> Result<(), SimulatorError>;
    fn pop_scope(&mut self);
}

/// Map-backed provider; scopes are slash-joined key prefixes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryParameterProvider {
    values: HashMap<String, ParamValue>,
    scope: Vec<String>,
}

impl InMemoryParameterProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: &str, value: ParamValue) {
        self.values.insert(path.to_string(), value);
    }

    pub fn set_double(&mut self, path: &str, v: f64) {
        self.set(path, ParamValue::Double(v));
    }

    pub fn set_int(&mut self, path: &str, v: i64) {
        self.set(path, ParamValue::Int(v));
    }

    pub fn set_bool(&mut self, path: &str, v: bool) {
        self.set(path, ParamValue::Bool(v));
    }

    pub fn set_string(&mut self, path: &str, v: &str) {
        self.set(path, ParamValue::Str(v.to_string()));
    }

    pub fn set_double_array(&mut self, path: &str, v: Vec<f64>) {
        self.set(path, ParamValue::DoubleArray(v));
    }

    fn full_key(&self, name: &str) -> String {
        if self.scope.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.scope.join("/"), name)
        }
    }

    fn lookup(&self, name: &str) -> Result<&ParamValue, SimulatorError> {
        let key = self.full_key(name);
        self.values
            .get(&key)
            .ok_or_else(|| SimulatorError::InvalidParameter(format!("missing key {}", key)))
    }
}

impl ParameterProvider for InMemoryParameterProvider {
    fn exists(&self, name: &str) -> bool {
        self.values.contains_key(&self.full_key(name))
    }

    fn get_double(&self, name: &str) -> Result<f64, SimulatorError> {
        match self.lookup(name)? {
            ParamValue::Double(v) => Ok(*v),
            ParamValue::Int(v) => Ok(*v as f64),
            other => Err(SimulatorError::InvalidParameter(format!(
                "{} is not a double (found {:?})",
                name, other
            ))),
        }
    }

    fn get_int(&self, name: &str) -> Result<i64, SimulatorError> {
        match self.lookup(name)? {
            ParamValue::Int(v) => Ok(*v),
            other => Err(SimulatorError::InvalidParameter(format!(
                "{} is not an integer (found {:?})",
                name, other
            ))),
        }
    }

    fn get_bool(&self, name: &str) -> Result<bool, SimulatorError> {
        match self.lookup(name)? {
            ParamValue::Bool(v) => Ok(*v),
            ParamValue::Int(v) => Ok(*v != 0),
            other => Err(SimulatorError::InvalidParameter(format!(
                "{} is not a bool (found {:?})",
                name, other
            ))),
        }
    }

    fn get_string(&self, name: &str) -> Result<String, SimulatorError> {
        match self.lookup(name)? {
            ParamValue::Str(v) => Ok(v.clone()),
            other => Err(SimulatorError::InvalidParameter(format!(
                "{} is not a string (found {:?})",
                name, other
            ))),
        }
    }

    fn get_double_array(&self, name: &str) -> Result<Vec<f64>, SimulatorError> {
        match self.lookup(name)? {
            ParamValue::DoubleArray(v) => Ok(v.clone()),
            ParamValue::Double(v) => Ok(vec![*v]),
            other => Err(SimulatorError::InvalidParameter(format!(
                "{} is not a double array (found {:?})",
                name, other
            ))),
        }
    }

    fn push_scope(&mut self, name: &str) -> Result<(), SimulatorError> {
        let prefix = format!("{}/", self.full_key(name));
        if !self.values.keys().any(|k| k.starts_with(&prefix)) {
            return Err(SimulatorError::InvalidParameter(format!(
                "scope {} does not exist",
                prefix
            )));
        }
        self.scope.push(name.to_string());
        Ok(())
    }

    fn pop_scope(&mut self) {
        self.scope.pop();
    }
}

/// Vector of variable-length slices; stores the fused sensitive-parameter
/// groups (all ids of one group share a single AD direction).
#[derive(Debug, Clone, Default)]
pub struct SlicedVector<T> {
    data: Vec<T>,
    offsets: Vec<usize>,
}

impl<T> SlicedVector<T> {
    pub fn new() -> Self {
        SlicedVector {
            data: Vec::new(),
            offsets: vec![0],
        }
    }

    pub fn push_back_slice(&mut self, items: Vec<T>) {
        self.data.extend(items);
        self.offsets.push(self.data.len());
    }

    /// number of stored slices (= number of AD directions)
    pub fn slices(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn get_slice(&self, i: usize) -> &[T] {
        &self.data[self.offsets[i]..self.offsets[i + 1]]
    }

    pub fn iter_all(&self) -> impl Iterator<Item = &T> {
        self.data.iter()
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.offsets = vec![0];
    }
}
