use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::core::ProcessId;
use crate::error::TransportError;
use crate::transport::{Envelope, HandlerId, Transport};

/// In-process transport connecting several worlds through channels.
#[derive(Clone)]
pub struct ChannelTransport {
    rank: ProcessId,
    peers: Arc<[Sender<Envelope>]>,
}

/// Builds a fully connected set of `size` transports, one per rank, each
/// paired with the inbox its world should drain.
pub fn mesh(size: usize) -> Vec<(ChannelTransport, Receiver<Envelope>)> {
    let (senders, inboxes): (Vec<_>, Vec<_>) =
        (0..size).map(|_| crossbeam_channel::unbounded()).unzip();
    let peers: Arc<[Sender<Envelope>]> = senders.into();

    inboxes
        .into_iter()
        .enumerate()
        .map(|(rank, inbox)| {
            let transport = ChannelTransport {
                rank,
                peers: peers.clone(),
            };
            (transport, inbox)
        })
        .collect()
}

impl Transport for ChannelTransport {
    fn rank(&self) -> ProcessId {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(
        &self,
        dest: ProcessId,
        handler: HandlerId,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let peer = self
            .peers
            .get(dest)
            .ok_or(TransportError::UnknownProcess(dest))?;

        let envelope = Envelope {
            source: self.rank,
            handler,
            payload,
        };

        peer.send(envelope)
            .map_err(|_| TransportError::Disconnected(dest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_delivers_in_order() {
        let mut mesh = mesh(2);
        let (_, inbox) = mesh.pop().unwrap();
        let (zero, _) = mesh.pop().unwrap();

        assert_eq!(zero.size(), 2);
        for i in 0..4u8 {
            zero.send(1, HandlerId::SET_FUTURE, vec![i]).unwrap();
        }

        let payloads: Vec<_> = inbox.try_iter().map(|env| env.payload[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_unknown_process() {
        let (transport, _inbox) = mesh(1).pop().unwrap();
        assert!(matches!(
            transport.send(5, HandlerId::SPAWN_TASK, Vec::new()),
            Err(TransportError::UnknownProcess(5))
        ));
    }
}
