use crate::{flatten, Value, VirtualMachine};
use anyhow::Result;

pub type HostFn =
    Box<dyn Fn(&[Value]) -> Result<Option<Value>> + Send + Sync>;

/// A host function callable from scripts. The VM pops the caller's argument
/// count and hands the arguments over in source order; the callback's return
/// value (or nil) becomes the call's result.
pub struct ExternalFn {
    pub name: String,
    pub arity: usize,
    pub variadic: bool,
    pub func: HostFn,
}

impl std::fmt::Debug for ExternalFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalFn")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("variadic", &self.variadic)
            .finish()
    }
}

impl ExternalFn {
    pub fn new<F>(name: &str, arity: usize, func: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            arity,
            variadic: false,
            func: Box::new(func),
        }
    }

    pub fn variadic<F>(name: &str, func: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            arity: 0,
            variadic: true,
            func: Box::new(func),
        }
    }
}

/// Bind the conventional standard library onto a fresh VM.
pub fn install_defaults(vm: &mut VirtualMachine) {
    vm.register_external(ExternalFn::variadic("println", |args| {
        println!("{}", flatten(args, " "));
        Ok(None)
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_fn_invocation() -> Result<()> {
        let add = ExternalFn::new("add", 2, |args| {
            crate::value::add(&args[0], &args[1])
                .map(Some)
                .map_err(Into::into)
        });
        assert_eq!(add.arity, 2);
        assert!(!add.variadic);
        let result = (add.func)(&[Value::Int(2), Value::Int(3)])?;
        assert_eq!(result, Some(Value::Int(5)));
        Ok(())
    }

    #[test]
    fn test_variadic_flag() {
        let any = ExternalFn::variadic("any", |args| {
            Ok(Some(Value::Int(args.len() as i64)))
        });
        assert!(any.variadic);
    }

    #[test]
    fn test_install_defaults_binds_println() {
        let mut vm = VirtualMachine::new();
        install_defaults(&mut vm);
        assert!(matches!(vm.global("println"), Some(Value::External(_))));
    }
}
