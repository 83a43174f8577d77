//! The default map-backed parameter server.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::error::AnyResult;
use crate::logic::{ParameterServer, ParameterServerLogic};
use crate::message::{ParamId, PartitionIndex};

/// Map-backed parameter store with lazy initialization and a user-supplied
/// fold.
///
/// The first pull for an id materializes it through `init`; a push folds the
/// delta through `update`, or — when no entry exists yet — stores the delta
/// itself as the initial value. Symmetric only: a job with distinct pull and
/// push types must bring its own [`ParameterServerLogic`], so a push delta
/// is never asked to stand in for a pull value.
///
/// On `close` the whole store is emitted as `(id, value)` server output
/// records.
pub struct MapPs<P, I, U> {
    params: HashMap<ParamId, P>,
    init: I,
    update: U,
}

impl<P, I, U> MapPs<P, I, U>
where
    I: FnMut(ParamId) -> P,
    U: FnMut(&P, P) -> P,
{
    pub fn new(init: I, update: U) -> Self {
        Self {
            params: HashMap::new(),
            init,
            update,
        }
    }

    /// Number of materialized parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl<P, I, U> ParameterServerLogic for MapPs<P, I, U>
where
    P: Clone + Send,
    I: FnMut(ParamId) -> P + Send,
    U: FnMut(&P, P) -> P + Send,
{
    type Pull = P;
    type Push = P;
    type Output = (ParamId, P);

    fn on_pull_recv(
        &mut self,
        id: ParamId,
        source: PartitionIndex,
        ps: &mut dyn ParameterServer<Pull = P, Output = (ParamId, P)>,
    ) -> AnyResult<()> {
        let Self { params, init, .. } = self;
        let value = params.entry(id).or_insert_with(|| init(id)).clone();
        ps.answer_pull(id, value, source);
        Ok(())
    }

    fn on_push_recv(
        &mut self,
        id: ParamId,
        delta: P,
        _ps: &mut dyn ParameterServer<Pull = P, Output = (ParamId, P)>,
    ) -> AnyResult<()> {
        let Self { params, update, .. } = self;
        match params.entry(id) {
            Entry::Occupied(mut entry) => {
                let next = update(entry.get(), delta);
                entry.insert(next);
            }
            // First push without a prior pull: the delta is the value.
            Entry::Vacant(entry) => {
                entry.insert(delta);
            }
        }
        Ok(())
    }

    fn on_parameter_recv(
        &mut self,
        id: ParamId,
        value: P,
        _ps: &mut dyn ParameterServer<Pull = P, Output = (ParamId, P)>,
    ) -> AnyResult<()> {
        self.params.insert(id, value);
        Ok(())
    }

    fn close(
        &mut self,
        ps: &mut dyn ParameterServer<Pull = P, Output = (ParamId, P)>,
    ) -> AnyResult<()> {
        for (id, value) in self.params.drain() {
            ps.output((id, value));
        }
        Ok(())
    }
}
