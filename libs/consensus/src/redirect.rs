//! Write redirection from non-leaders to the current leader
//!
//! A forwarded write is tracked under a request id until the leader answers
//! or the caller gives up.

use crate::rpc::{ForwardRequest, ForwardResponse, RaftMessage};
use crate::transport::Transport;
use crate::types::NodeId;
use crate::{RaftError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace};

pub(crate) type ResultSender = oneshot::Sender<Result<Bytes>>;

#[derive(Default)]
pub(crate) struct Redirector {
    next_request_id: u64,
    pending: HashMap<u64, ResultSender>,
}

impl Redirector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `command` to `leader` and remember who waits for the answer
    ///
    /// Without a known leader the caller fails at once with `NoLeader`.
    pub fn forward(
        &mut self,
        transport: &dyn Transport,
        leader: Option<&NodeId>,
        command: Bytes,
        response: ResultSender,
    ) {
        let leader = match leader {
            Some(leader) => leader,
            None => {
                let _ = response.send(Err(RaftError::NoLeader));
                return;
            }
        };

        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let payload = RaftMessage::Forward(ForwardRequest {
            request_id,
            command,
        })
        .encode();

        match payload.and_then(|p| transport.send(leader, p)) {
            Ok(()) => {
                debug!(%leader, request_id, "Forwarded write to leader");
                self.pending.insert(request_id, response);
            }
            Err(e) => {
                let _ = response.send(Err(e));
            }
        }
    }

    /// Deliver the leader's answer to the waiting caller
    pub fn complete(&mut self, resp: ForwardResponse) {
        match self.pending.remove(&resp.request_id) {
            Some(tx) => {
                let _ = tx.send(resp.result.map_err(RaftError::from));
            }
            None => trace!(request_id = resp.request_id, "No caller for forwarded write"),
        }
    }

    /// Forget callers that stopped waiting
    pub fn sweep(&mut self) {
        self.pending.retain(|_, tx| !tx.is_closed());
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn fail_all(&mut self) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(RaftError::ShuttingDown));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ForwardFailure;
    use crate::transport::LocalNetwork;

    #[tokio::test]
    async fn test_forward_without_leader_fails_fast() {
        let network = LocalNetwork::new();
        let (a, _inbox) = network.join("A");
        let mut redirector = Redirector::new();

        let (tx, rx) = oneshot::channel();
        redirector.forward(&*a, None, Bytes::from_static(b"x"), tx);
        assert!(matches!(rx.await.unwrap(), Err(RaftError::NoLeader)));
        assert_eq!(redirector.pending(), 0);
    }

    #[tokio::test]
    async fn test_forward_and_complete() {
        let network = LocalNetwork::new();
        let (a, _a_inbox) = network.join("A");
        let (_b, b_inbox) = network.join("B");
        let mut redirector = Redirector::new();

        let (tx, rx) = oneshot::channel();
        redirector.forward(&*a, Some(&NodeId::from("B")), Bytes::from_static(b"x"), tx);

        let envelope = b_inbox.recv().await.unwrap();
        let request_id = match RaftMessage::decode(&envelope.payload).unwrap() {
            RaftMessage::Forward(req) => {
                assert_eq!(&req.command[..], b"x");
                req.request_id
            }
            other => panic!("unexpected message {:?}", other),
        };

        redirector.complete(ForwardResponse {
            request_id,
            result: Ok(Bytes::from_static(b"done")),
        });
        assert_eq!(&rx.await.unwrap().unwrap()[..], b"done");
    }

    #[tokio::test]
    async fn test_leader_refusal_is_mapped() {
        let network = LocalNetwork::new();
        let (a, _a_inbox) = network.join("A");
        let (_b, _b_inbox) = network.join("B");
        let mut redirector = Redirector::new();

        let (tx, rx) = oneshot::channel();
        redirector.forward(&*a, Some(&NodeId::from("B")), Bytes::new(), tx);
        redirector.complete(ForwardResponse {
            request_id: 1,
            result: Err(ForwardFailure::NotLeader(None)),
        });
        assert!(matches!(rx.await.unwrap(), Err(RaftError::NoLeader)));
    }

    #[tokio::test]
    async fn test_sweep_and_fail_all() {
        let network = LocalNetwork::new();
        let (a, _a_inbox) = network.join("A");
        let (_b, _b_inbox) = network.join("B");
        let leader = NodeId::from("B");
        let mut redirector = Redirector::new();

        let (gone_tx, gone_rx) = oneshot::channel();
        let (live_tx, live_rx) = oneshot::channel();
        redirector.forward(&*a, Some(&leader), Bytes::new(), gone_tx);
        redirector.forward(&*a, Some(&leader), Bytes::new(), live_tx);
        drop(gone_rx);

        redirector.sweep();
        assert_eq!(redirector.pending(), 1);

        redirector.fail_all();
        assert!(matches!(live_rx.await.unwrap(), Err(RaftError::ShuttingDown)));
    }
}
