use paramflow_core::logic::{ParameterServerClient, WorkerLogic};
use paramflow_core::message::ParamId;
use paramflow_core::AnyResult;

/// Counts key occurrences: every training record is a key, every key is a
/// `+1` push against its parameter. Run against the default map-backed
/// server with `init = 0` and an additive fold, the final server snapshot
/// is the key frequency table.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountingWorker;

impl WorkerLogic for CountingWorker {
    type Record = ParamId;
    type Pull = i64;
    type Push = i64;
    type Output = ();

    fn on_recv(
        &mut self,
        record: ParamId,
        client: &mut dyn ParameterServerClient<Push = i64, Output = ()>,
    ) -> AnyResult<()> {
        client.push(record, 1);
        Ok(())
    }

    fn on_pull_recv(
        &mut self,
        id: ParamId,
        _value: i64,
        _client: &mut dyn ParameterServerClient<Push = i64, Output = ()>,
    ) -> AnyResult<()> {
        anyhow::bail!("counting worker never pulls, got an answer for {id}")
    }
}
