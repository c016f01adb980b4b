//! Operator trait and the registration table used to resolve node ops.

use std::any::Any;
use std::collections::HashMap;
use std::mem::size_of;

use crate::context::{InvokeContext, PrepareContext};
use crate::errors::{Result, RuntimeError};

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// A kernel with a three-stage lifecycle: decode options, prepare, invoke.
///
/// `init` runs once per node while the graph is built and produces the
/// node's persistent state. `prepare` runs once after activation tensors are
/// placed and may reserve scratch memory. `invoke` runs for every inference.
pub trait Operator {
    type State: 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    fn init(&self, options: &[u8]) -> std::result::Result<Self::State, Self::Error>;

    fn prepare(
        &self,
        ctx: &mut PrepareContext<'_>,
        state: &mut Self::State,
    ) -> std::result::Result<(), Self::Error>;

    fn invoke(
        &self,
        ctx: &mut InvokeContext<'_>,
        state: &Self::State,
    ) -> std::result::Result<(), Self::Error>;
}

pub(crate) enum StageFailure {
    Kernel(BoxedError),
    MissingState,
}

/// Type-erased operator stored in the resolver.
pub(crate) trait RegisteredOperator {
    fn state_bytes(&self) -> usize;

    fn init(&self, options: &[u8]) -> std::result::Result<Box<dyn Any>, BoxedError>;

    fn prepare(
        &self,
        ctx: &mut PrepareContext<'_>,
        state: &mut dyn Any,
    ) -> std::result::Result<(), StageFailure>;

    fn invoke(
        &self,
        ctx: &mut InvokeContext<'_>,
        state: &dyn Any,
    ) -> std::result::Result<(), StageFailure>;
}

impl<O: Operator> RegisteredOperator for O {
    fn state_bytes(&self) -> usize {
        size_of::<O::State>()
    }

    fn init(&self, options: &[u8]) -> std::result::Result<Box<dyn Any>, BoxedError> {
        let state = Operator::init(self, options).map_err(|err| Box::new(err) as BoxedError)?;
        Ok(Box::new(state))
    }

    fn prepare(
        &self,
        ctx: &mut PrepareContext<'_>,
        state: &mut dyn Any,
    ) -> std::result::Result<(), StageFailure> {
        let state = state
            .downcast_mut::<O::State>()
            .ok_or(StageFailure::MissingState)?;
        Operator::prepare(self, ctx, state).map_err(|err| StageFailure::Kernel(Box::new(err)))
    }

    fn invoke(
        &self,
        ctx: &mut InvokeContext<'_>,
        state: &dyn Any,
    ) -> std::result::Result<(), StageFailure> {
        let state = state
            .downcast_ref::<O::State>()
            .ok_or(StageFailure::MissingState)?;
        Operator::invoke(self, ctx, state).map_err(|err| StageFailure::Kernel(Box::new(err)))
    }
}

/// Fixed-capacity table mapping op names to registered kernels.
pub struct OpResolver {
    capacity: usize,
    operators: HashMap<String, Box<dyn RegisteredOperator>>,
}

impl OpResolver {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            operators: HashMap::with_capacity(capacity),
        }
    }

    pub fn add<O: Operator + 'static>(&mut self, name: impl Into<String>, operator: O) -> Result<()> {
        let name = name.into();
        if self.operators.contains_key(&name) {
            return Err(RuntimeError::DuplicateOperator(name));
        }
        if self.operators.len() >= self.capacity {
            return Err(RuntimeError::ResolverFull {
                capacity: self.capacity,
            });
        }
        log::debug!("registered operator '{}'", name);
        self.operators.insert(name, Box::new(operator));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    pub(crate) fn find(&self, name: &str) -> Result<&dyn RegisteredOperator> {
        self.operators
            .get(name)
            .map(|operator| &**operator)
            .ok_or_else(|| RuntimeError::UnknownOperator(name.to_string()))
    }
}
