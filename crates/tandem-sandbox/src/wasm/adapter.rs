//! Signature adapters: typed native functions behind a slot-level interface.
//!
//! A native host function is any `Fn(&mut S, P1, .., Pn) -> Result<R>` where
//! every `Pi` is a [`Param`] and `R` is [`Results`]. The adapter decodes the
//! parameters from their cumulative slot ranges, calls the function with the
//! per-instance state `S`, and encodes the results into the leading slots of
//! the same stack.
//!
//! ```rust,ignore
//! fn add_request(state: &mut AddState, i: Ptr<i32>, j: Ptr<i32>) -> Result<(Ptr<i32>, Ptr<i32>)>;
//! let function = HostFunction::new(add_request);
//! assert_eq!(function.signature().param_slots(), 2);
//! assert_eq!(function.signature().result_slots(), 0);
//! ```

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use wasmtime::{Engine, FuncType, ValType};

use super::codec::{GuestMemory, Param, Results, Slot, ValueKind};
use crate::error::{Result, SandboxError};

/// Parameter and result kinds of a host function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    params: Vec<ValueKind>,
    results: Vec<ValueKind>,
}

impl Signature {
    /// Build a signature from its kinds.
    pub fn new(params: Vec<ValueKind>, results: Vec<ValueKind>) -> Self {
        Self { params, results }
    }

    /// Parameter kinds in order.
    pub fn params(&self) -> &[ValueKind] {
        &self.params
    }

    /// Result kinds in order.
    pub fn results(&self) -> &[ValueKind] {
        &self.results
    }

    /// Total slots taken by the parameters.
    pub fn param_slots(&self) -> usize {
        self.params.iter().map(|kind| kind.param_slots()).sum()
    }

    /// Total slots written to the return area.
    pub fn result_slots(&self) -> usize {
        self.results.iter().map(|kind| kind.result_slots()).sum()
    }

    /// Stack length an invocation needs: params and results share the stack.
    pub fn stack_len(&self) -> usize {
        self.param_slots().max(self.result_slots())
    }

    /// Slot range of every parameter. A parameter of width K shifts all
    /// following ranges by K.
    pub fn param_ranges(&self) -> Vec<Range<usize>> {
        let mut offset = 0;
        self.params
            .iter()
            .map(|kind| {
                let start = offset;
                offset += kind.param_slots();
                start..offset
            })
            .collect()
    }

    /// Flattened engine parameter types.
    pub fn param_types(&self) -> Vec<ValType> {
        self.params.iter().flat_map(|kind| kind.param_types()).collect()
    }

    /// Flattened engine result types.
    pub fn result_types(&self) -> Vec<ValType> {
        self.results.iter().flat_map(|kind| kind.result_types()).collect()
    }

    /// Engine function type for this signature.
    pub fn func_type(&self, engine: &Engine) -> FuncType {
        FuncType::new(engine, self.param_types(), self.result_types())
    }
}

type Invoke<S> = dyn Fn(&mut S, &mut GuestMemory<'_>, &mut [Slot]) -> Result<()> + Send + Sync;

/// A host function adapted to the slot calling convention.
///
/// Cloning is cheap; clones share the native function.
pub struct HostFunction<S> {
    signature: Signature,
    invoke: Arc<Invoke<S>>,
}

impl<S> Clone for HostFunction<S> {
    fn clone(&self) -> Self {
        Self {
            signature: self.signature.clone(),
            invoke: Arc::clone(&self.invoke),
        }
    }
}

impl<S> fmt::Debug for HostFunction<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

impl<S: 'static> HostFunction<S> {
    /// Adapt a typed native function.
    pub fn new<Args, R, F>(func: F) -> Self
    where
        F: IntoHostFunction<S, Args, R>,
    {
        func.into_host_function()
    }

    /// Wrap an already slot-level implementation.
    pub fn from_raw<F>(signature: Signature, invoke: F) -> Self
    where
        F: Fn(&mut S, &mut GuestMemory<'_>, &mut [Slot]) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            signature,
            invoke: Arc::new(invoke),
        }
    }

    /// The function's signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Decode, call and encode against `stack`, which must hold at least
    /// `signature().stack_len()` slots.
    pub fn invoke(
        &self,
        state: &mut S,
        memory: &mut GuestMemory<'_>,
        stack: &mut [Slot],
    ) -> Result<()> {
        let expected = self.signature.stack_len();
        if stack.len() < expected {
            return Err(SandboxError::SlotCount {
                expected,
                actual: stack.len(),
            });
        }
        (self.invoke)(state, memory, stack)
    }
}

/// Conversion from a typed native function into a [`HostFunction`].
///
/// Implemented for functions of up to four parameters; `Args` is the tuple
/// of parameter types and only exists to keep the impls apart.
pub trait IntoHostFunction<S, Args, R> {
    /// Build the adapter.
    fn into_host_function(self) -> HostFunction<S>;
}

macro_rules! impl_into_host_function {
    ($($p:ident),*) => {
        impl<S, F, R, $($p,)*> IntoHostFunction<S, ($($p,)*), R> for F
        where
            S: 'static,
            F: Fn(&mut S, $($p),*) -> Result<R> + Send + Sync + 'static,
            R: Results,
            $($p: Param,)*
        {
            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn into_host_function(self) -> HostFunction<S> {
                let signature = Signature::new(vec![$($p::KIND),*], R::kinds());
                let ranges = signature.param_ranges();
                HostFunction::from_raw(signature, move |state, memory, stack| {
                    let mut ranges = ranges.iter().cloned();
                    $(
                        let $p = {
                            let range = ranges.next().unwrap_or(0..0);
                            $p::decode(&stack[range], memory)?
                        };
                    )*
                    let results = (self)(state, $($p),*)?;
                    results.encode(stack, memory)
                })
            }
        }
    };
}

impl_into_host_function!();
impl_into_host_function!(P1);
impl_into_host_function!(P1, P2);
impl_into_host_function!(P1, P2, P3);
impl_into_host_function!(P1, P2, P3, P4);
