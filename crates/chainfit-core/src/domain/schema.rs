//! Declared data and parameter schemas, data binding validation, and
//! flattening of container parameters into draw columns.
//!
//! Dimensions are either fixed sizes or the name of an integer data
//! variable, so `vector[J] theta` resolves against the bound data.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::DataBindingError;

/// Data bound to a model: variable name to JSON value, as in a Stan data file.
pub type DataBinding = BTreeMap<String, Value>;

/// Scalar element type of a data variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElemType {
    Int,
    Real,
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElemType::Int => f.write_str("int"),
            ElemType::Real => f.write_str("real"),
        }
    }
}

/// One dimension of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dim {
    Fixed(usize),
    /// Size given by an integer data variable.
    Data(String),
}

impl From<usize> for Dim {
    fn from(n: usize) -> Self {
        Dim::Fixed(n)
    }
}

impl From<&str> for Dim {
    fn from(name: &str) -> Self {
        Dim::Data(name.to_string())
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(n) => write!(f, "{n}"),
            Dim::Data(name) => f.write_str(name),
        }
    }
}

/// A declared data variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarDecl {
    pub name: String,
    pub elem: ElemType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dims: Vec<Dim>,
}

impl VarDecl {
    pub fn int(name: &str) -> Self {
        Self {
            name: name.to_string(),
            elem: ElemType::Int,
            dims: Vec::new(),
        }
    }

    pub fn real(name: &str) -> Self {
        Self {
            name: name.to_string(),
            elem: ElemType::Real,
            dims: Vec::new(),
        }
    }

    /// Append an outer-to-inner dimension.
    pub fn dim(mut self, dim: impl Into<Dim>) -> Self {
        self.dims.push(dim.into());
        self
    }
}

/// A declared model parameter. Parameters are always real-valued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDecl {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dims: Vec<Dim>,
}

impl ParamDecl {
    pub fn scalar(name: &str) -> Self {
        Self {
            name: name.to_string(),
            dims: Vec::new(),
        }
    }

    pub fn dim(mut self, dim: impl Into<Dim>) -> Self {
        self.dims.push(dim.into());
        self
    }
}

/// Resolve `dims` of variable `owner` against the bound data.
fn resolve_dims(
    owner: &str,
    dims: &[Dim],
    data: &DataBinding,
) -> Result<Vec<usize>, DataBindingError> {
    dims.iter()
        .map(|dim| match dim {
            Dim::Fixed(n) => Ok(*n),
            Dim::Data(var) => data
                .get(var)
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .ok_or_else(|| DataBindingError::UnresolvedDim {
                    name: owner.to_string(),
                    dim: var.clone(),
                }),
        })
        .collect()
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(n) if n.is_i64() || n.is_u64() => "int".to_string(),
        Value::Number(_) => "real".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(items) => format!("array of length {}", items.len()),
        Value::Object(_) => "object".to_string(),
    }
}

fn check_value(
    decl: &VarDecl,
    value: &Value,
    shape: &[usize],
) -> Result<(), DataBindingError> {
    match shape.split_first() {
        None => {
            let ok = match decl.elem {
                ElemType::Int => value.is_i64() || value.is_u64(),
                ElemType::Real => value.is_number(),
            };
            if ok {
                Ok(())
            } else {
                Err(DataBindingError::WrongType {
                    name: decl.name.clone(),
                    expected: decl.elem,
                    found: describe(value),
                })
            }
        }
        Some((&len, inner)) => match value {
            Value::Array(items) if items.len() == len => {
                items.iter().try_for_each(|item| check_value(decl, item, inner))
            }
            other => Err(DataBindingError::WrongShape {
                name: decl.name.clone(),
                expected: shape.to_vec(),
                found: describe(other),
            }),
        },
    }
}

/// Check `data` against the declared data schema.
///
/// Every declared variable must be present with the declared element type and
/// shape. Undeclared keys are ignored.
pub fn validate_data(decls: &[VarDecl], data: &DataBinding) -> Result<(), DataBindingError> {
    for decl in decls {
        let value = data
            .get(&decl.name)
            .ok_or_else(|| DataBindingError::MissingKey {
                name: decl.name.clone(),
            })?;
        let shape = resolve_dims(&decl.name, &decl.dims, data)?;
        check_value(decl, value, &shape)?;
    }
    Ok(())
}

/// Flatten declared parameters into draw column names.
///
/// Scalars keep their name; containers expand row-major with 1-based
/// indices, e.g. `theta[1]`, `L[2,1]`.
pub fn flatten_columns(
    params: &[ParamDecl],
    data: &DataBinding,
) -> Result<Vec<String>, DataBindingError> {
    let mut columns = Vec::new();
    for param in params {
        let shape = resolve_dims(&param.name, &param.dims, data)?;
        if shape.is_empty() {
            columns.push(param.name.clone());
            continue;
        }
        let total: usize = shape.iter().product();
        let mut index = vec![1usize; shape.len()];
        for _ in 0..total {
            let joined = index
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",");
            columns.push(format!("{}[{}]", param.name, joined));
            // odometer increment, last index fastest
            for axis in (0..shape.len()).rev() {
                if index[axis] < shape[axis] {
                    index[axis] += 1;
                    break;
                }
                index[axis] = 1;
            }
        }
    }
    Ok(columns)
}

/// Base parameter name of a flattened column: `theta[3]` → `theta`.
pub fn base_name(column: &str) -> &str {
    column.split('[').next().unwrap_or(column)
}
