//! A trivial `StateMachine` used by the scenario tests: applying a command
//! just echoes its payload back as the reply, which is enough to observe
//! ordering and revisions without needing a real mod's business logic.

use rsm_core::state_machine::{CommandOutcome, StateMachine};
use rsm_core::types::Revision;

pub struct EchoKv;

impl StateMachine for EchoKv {
    type Data = Vec<Vec<u8>>;

    fn init(&self, _config_payload: &[u8]) -> Self::Data {
        Vec::new()
    }

    fn handle_command(&self, data: &Self::Data, cmd: &[u8]) -> CommandOutcome<Self::Data> {
        if cmd == b"reject-me" {
            return CommandOutcome::Reject(b"rejected".to_vec());
        }
        let mut next = data.clone();
        next.push(cmd.to_vec());
        CommandOutcome::Apply(next)
    }

    fn handle_query(&self, data: &Self::Data, _query: &[u8]) -> Vec<u8> {
        data.last().cloned().unwrap_or_default()
    }

    fn apply_command(&self, mut data: Self::Data, cmd: &[u8], _revision: Revision) -> (Vec<u8>, Self::Data) {
        data.push(cmd.to_vec());
        (cmd.to_vec(), data)
    }
}
