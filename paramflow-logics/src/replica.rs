use std::collections::HashMap;

use paramflow_core::logic::{ParameterServerClient, WorkerLogic};
use paramflow_core::message::ParamId;
use paramflow_core::AnyResult;
use tracing::debug;

/// Read-through worker for jobs carrying a read-mostly parameter replica,
/// preloaded through a double-sided model load.
///
/// A lookup that hits the local replica is answered without touching the
/// server tier; a miss falls back to a pull, and the answer is cached
/// before being emitted. Worker-side model copies land in the replica via
/// `update_model`.
#[derive(Debug, Default)]
pub struct ReplicaWorker<P> {
    replica: HashMap<ParamId, P>,
}

impl<P> ReplicaWorker<P> {
    pub fn new() -> Self {
        Self {
            replica: HashMap::new(),
        }
    }

    /// Number of locally replicated parameters.
    pub fn replicated(&self) -> usize {
        self.replica.len()
    }
}

impl<P: Clone + Send> WorkerLogic for ReplicaWorker<P> {
    type Record = ParamId;
    type Pull = P;
    type Push = P;
    type Output = (ParamId, P);

    fn on_recv(
        &mut self,
        record: ParamId,
        client: &mut dyn ParameterServerClient<Push = P, Output = (ParamId, P)>,
    ) -> AnyResult<()> {
        match self.replica.get(&record) {
            Some(value) => client.output((record, value.clone())),
            None => {
                debug!(id = record, "replica miss, pulling");
                client.pull(record);
            }
        }
        Ok(())
    }

    fn on_pull_recv(
        &mut self,
        id: ParamId,
        value: P,
        client: &mut dyn ParameterServerClient<Push = P, Output = (ParamId, P)>,
    ) -> AnyResult<()> {
        self.replica.insert(id, value.clone());
        client.output((id, value));
        Ok(())
    }

    fn update_model(&mut self, id: ParamId, value: P) -> AnyResult<()> {
        self.replica.insert(id, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use paramflow_core::config::JobConfig;
    use paramflow_core::message::{JobOutput, ModelRecord};
    use paramflow_core::store::MapPs;
    use paramflow_core::transform_with_double_model_load;

    use super::ReplicaWorker;

    #[test]
    fn test_replica_hits_and_pull_fallback() {
        let mut config = JobConfig::new(1, 2, 300);
        config.runtime.cpu_affinity = false;
        let model = vec![
            ModelRecord::Worker(1, 11i64),
            ModelRecord::Server(2, 22i64),
            ModelRecord::Worker(3, 33i64),
        ];
        let handle = transform_with_double_model_load(
            model,
            [1, 2, 3],
            |_| ReplicaWorker::new(),
            |_| MapPs::new(|_| 0i64, |v: &i64, d: i64| v + d),
            &config,
        )
        .unwrap();
        let mut lookups: Vec<_> = handle
            .wait()
            .unwrap()
            .into_iter()
            .filter_map(JobOutput::worker)
            .collect();
        lookups.sort_unstable();
        assert_eq!(lookups, vec![(1, 11), (2, 22), (3, 33)]);
    }
}
