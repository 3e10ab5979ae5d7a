use crate::flatten;
use std::cell::RefCell;
use std::fmt::{self, Display, Formatter};
use std::rc::Rc;
use thiserror::Error;

/// Errors produced by the arithmetic, comparison, and cast helpers. The VM
/// treats operand errors as recoverable (it pushes nil and continues), so
/// they are a dedicated type rather than `anyhow` strings.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum TypeError {
    #[error("type mismatch")]
    Mismatch,
    #[error("operation is unsupported for type")]
    Unsupported,
    #[error("division by zero")]
    DivisionByZero,
    #[error("cannot cast {from} to {to}")]
    Cast { from: TypeId, to: TypeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeId {
    Nil,
    Int,
    Float,
    Bool,
    Array,
    Func,
    External,
    Type,
    Any,
}

impl Display for TypeId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            TypeId::Nil => "nil",
            TypeId::Int => "int",
            TypeId::Float => "float",
            TypeId::Bool => "bool",
            TypeId::Array => "array",
            TypeId::Func => "func",
            TypeId::External => "external",
            TypeId::Type => "type",
            TypeId::Any => "any",
        };
        write!(f, "{}", name)
    }
}

pub type ArrayRef = Rc<RefCell<Vec<Value>>>;

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(ArrayRef),
    /// Index of the first instruction of the function body.
    Func(usize),
    /// Index into the VM's external function registry.
    External(u32),
    Type(TypeId),
}

impl Value {
    pub fn array(values: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(values)))
    }

    pub fn type_of(&self) -> TypeId {
        match self {
            Value::Nil => TypeId::Nil,
            Value::Int(_) => TypeId::Int,
            Value::Float(_) => TypeId::Float,
            Value::Bool(_) => TypeId::Bool,
            Value::Array(_) => TypeId::Array,
            Value::Func(_) => TypeId::Func,
            Value::External(_) => TypeId::External,
            Value::Type(_) => TypeId::Type,
        }
    }

    /// nil, false, and numeric zero are false; everything else is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(0) => false,
            Value::Float(f) => *f != 0.0,
            _ => true,
        }
    }

    /// Coerce into the given target type. `Any` passes every value through
    /// unchanged; the numeric/bool conversions follow the cast table.
    pub fn cast(&self, target: TypeId) -> Result<Value, TypeError> {
        let value = match (target, self) {
            (TypeId::Any, v) => v.clone(),
            (TypeId::Int, Value::Int(i)) => Value::Int(*i),
            (TypeId::Int, Value::Float(f)) => Value::Int(*f as i64),
            (TypeId::Int, Value::Bool(b)) => Value::Int(i64::from(*b)),
            (TypeId::Float, Value::Int(i)) => Value::Float(*i as f64),
            (TypeId::Float, Value::Float(f)) => Value::Float(*f),
            (TypeId::Float, Value::Bool(b)) => {
                Value::Float(if *b { 1.0 } else { 0.0 })
            }
            (TypeId::Bool, Value::Int(i)) => Value::Bool(*i != 0),
            (TypeId::Bool, Value::Float(f)) => Value::Bool(*f != 0.0),
            (TypeId::Bool, Value::Bool(b)) => Value::Bool(*b),
            (TypeId::Array, Value::Array(a)) => Value::Array(a.clone()),
            (to, from) => {
                return Err(TypeError::Cast {
                    from: from.type_of(),
                    to,
                })
            }
        };
        Ok(value)
    }
}

/// Equality is same-tag only. Arrays compare by reference identity so that
/// aliasing is observable; functions by address, externals by registry index.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Func(a), Value::Func(b)) => a == b,
            (Value::External(a), Value::External(b)) => a == b,
            (Value::Type(a), Value::Type(b)) => a == b,
            _ => false,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Array(a) => {
                write!(f, "[{}]", flatten(&a.borrow(), ", "))
            }
            Value::Func(address) => write!(f, "<func {}>", address),
            Value::External(_) => write!(f, "<external function>"),
            Value::Type(id) => write!(f, "<type {}>", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Lt,
    Gt,
    Lte,
    Gte,
}

fn numeric_pair(a: &Value, b: &Value) -> Result<(), TypeError> {
    if a.type_of() != b.type_of() {
        return Err(TypeError::Mismatch);
    }
    match a {
        Value::Int(_) | Value::Float(_) => Ok(()),
        _ => Err(TypeError::Unsupported),
    }
}

pub fn add(a: &Value, b: &Value) -> Result<Value, TypeError> {
    numeric_pair(a, b)?;
    Ok(match (a, b) {
        (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(*b)),
        (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
        _ => unreachable!(),
    })
}

pub fn sub(a: &Value, b: &Value) -> Result<Value, TypeError> {
    numeric_pair(a, b)?;
    Ok(match (a, b) {
        (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_sub(*b)),
        (Value::Float(a), Value::Float(b)) => Value::Float(a - b),
        _ => unreachable!(),
    })
}

pub fn mul(a: &Value, b: &Value) -> Result<Value, TypeError> {
    numeric_pair(a, b)?;
    Ok(match (a, b) {
        (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_mul(*b)),
        (Value::Float(a), Value::Float(b)) => Value::Float(a * b),
        _ => unreachable!(),
    })
}

pub fn div(a: &Value, b: &Value) -> Result<Value, TypeError> {
    numeric_pair(a, b)?;
    Ok(match (a, b) {
        (Value::Int(_), Value::Int(0)) => return Err(TypeError::DivisionByZero),
        (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_div(*b)),
        (Value::Float(a), Value::Float(b)) => Value::Float(a / b),
        _ => unreachable!(),
    })
}

pub fn neg(a: &Value) -> Result<Value, TypeError> {
    match a {
        Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
        Value::Float(f) => Ok(Value::Float(-f)),
        _ => Err(TypeError::Unsupported),
    }
}

/// Equality accepts any two values of identical tag; ordered comparisons
/// accept only same-tag numeric pairs.
pub fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<bool, TypeError> {
    if op == CmpOp::Eq {
        if a.type_of() != b.type_of() {
            return Err(TypeError::Mismatch);
        }
        return Ok(a == b);
    }
    numeric_pair(a, b)?;
    Ok(match (a, b) {
        (Value::Int(a), Value::Int(b)) => match op {
            CmpOp::Lt => a < b,
            CmpOp::Gt => a > b,
            CmpOp::Lte => a <= b,
            CmpOp::Gte => a >= b,
            CmpOp::Eq => unreachable!(),
        },
        (Value::Float(a), Value::Float(b)) => match op {
            CmpOp::Lt => a < b,
            CmpOp::Gt => a > b,
            CmpOp::Lte => a <= b,
            CmpOp::Gte => a >= b,
            CmpOp::Eq => unreachable!(),
        },
        _ => unreachable!(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Int(-3).is_truthy());
        assert!(Value::Float(0.5).is_truthy());
        assert!(Value::array(vec![]).is_truthy());
        assert!(Value::Func(0).is_truthy());
    }

    #[test]
    fn test_arithmetic_same_tag() {
        assert_eq!(add(&Value::Int(2), &Value::Int(3)), Ok(Value::Int(5)));
        assert_eq!(
            sub(&Value::Float(1.5), &Value::Float(0.5)),
            Ok(Value::Float(1.0))
        );
        assert_eq!(mul(&Value::Int(4), &Value::Int(-2)), Ok(Value::Int(-8)));
        assert_eq!(div(&Value::Int(7), &Value::Int(2)), Ok(Value::Int(3)));
    }

    #[test]
    fn test_arithmetic_errors() {
        assert_eq!(
            add(&Value::Int(1), &Value::Float(1.0)),
            Err(TypeError::Mismatch)
        );
        assert_eq!(
            add(&Value::Bool(true), &Value::Bool(true)),
            Err(TypeError::Unsupported)
        );
        assert_eq!(
            div(&Value::Int(1), &Value::Int(0)),
            Err(TypeError::DivisionByZero)
        );
        assert_eq!(neg(&Value::Nil), Err(TypeError::Unsupported));
    }

    #[test]
    fn test_float_division_follows_ieee() {
        let result = div(&Value::Float(1.0), &Value::Float(0.0)).unwrap();
        assert_eq!(result, Value::Float(f64::INFINITY));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(compare(CmpOp::Eq, &Value::Nil, &Value::Nil), Ok(true));
        assert_eq!(
            compare(CmpOp::Lt, &Value::Float(1.0), &Value::Float(2.0)),
            Ok(true)
        );
        assert_eq!(
            compare(CmpOp::Gte, &Value::Int(2), &Value::Int(2)),
            Ok(true)
        );
        assert_eq!(
            compare(CmpOp::Eq, &Value::Int(1), &Value::Float(1.0)),
            Err(TypeError::Mismatch)
        );
        assert_eq!(
            compare(CmpOp::Lt, &Value::Bool(false), &Value::Bool(true)),
            Err(TypeError::Unsupported)
        );
    }

    #[test]
    fn test_comparison_totality_on_numbers() {
        let pairs = [(1.0, 2.0), (2.0, 1.0), (3.0, 3.0)];
        for (a, b) in pairs {
            let a = Value::Float(a);
            let b = Value::Float(b);
            let lt = compare(CmpOp::Lt, &a, &b).unwrap();
            let gt = compare(CmpOp::Gt, &a, &b).unwrap();
            let eq = compare(CmpOp::Eq, &a, &b).unwrap();
            assert_eq!(
                1,
                [lt, gt, eq].iter().filter(|v| **v).count(),
                "exactly one of <, >, == must hold for {} and {}",
                a,
                b
            );
            let lte = compare(CmpOp::Lte, &a, &b).unwrap();
            assert_eq!(lte, lt || eq);
        }
    }

    #[test]
    fn test_array_equality_is_identity() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = Value::array(vec![Value::Int(1)]);
        let alias = a.clone();
        assert_ne!(a, b);
        assert_eq!(a, alias);
    }

    #[test]
    fn test_cast_table() {
        assert_eq!(Value::Float(3.9).cast(TypeId::Int), Ok(Value::Int(3)));
        assert_eq!(Value::Bool(true).cast(TypeId::Int), Ok(Value::Int(1)));
        assert_eq!(Value::Int(2).cast(TypeId::Float), Ok(Value::Float(2.0)));
        assert_eq!(
            Value::Float(0.0).cast(TypeId::Bool),
            Ok(Value::Bool(false))
        );
        assert_eq!(Value::Nil.cast(TypeId::Any), Ok(Value::Nil));
        assert_eq!(
            Value::Nil.cast(TypeId::Int),
            Err(TypeError::Cast {
                from: TypeId::Nil,
                to: TypeId::Int
            })
        );
        assert_eq!(
            Value::array(vec![]).cast(TypeId::Bool),
            Err(TypeError::Cast {
                from: TypeId::Array,
                to: TypeId::Bool
            })
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Nil.to_string(), "nil");
        assert_eq!(Value::Float(7.0).to_string(), "7");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(
            Value::array(vec![Value::Float(1.0), Value::Nil]).to_string(),
            "[1, nil]"
        );
        assert_eq!(Value::Func(12).to_string(), "<func 12>");
        assert_eq!(Value::Type(TypeId::Int).to_string(), "<type int>");
    }
}
