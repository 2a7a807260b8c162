use std::fmt;

use crate::types::ValueType;

/// A function type: parameter types followed by result types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionSig {
    params: Box<[ValueType]>,
    results: Box<[ValueType]>,
}

impl FunctionSig {
    pub fn new(params: &[ValueType], results: &[ValueType]) -> Self {
        Self {
            params: params.into(),
            results: results.into(),
        }
    }

    #[inline]
    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    #[inline]
    pub fn results(&self) -> &[ValueType] {
        &self.results
    }

    #[inline]
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    #[inline]
    pub fn result_count(&self) -> usize {
        self.results.len()
    }
}

impl fmt::Display for FunctionSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_list(f, &self.params)?;
        f.write_str(" -> ")?;
        write_list(f, &self.results)
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, types: &[ValueType]) -> fmt::Result {
    f.write_str("(")?;
    for (i, ty) in types.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{ty}")?;
    }
    f.write_str(")")
}
