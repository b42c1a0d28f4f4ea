//! Share-nothing worker: owns its flow table and classifier, runs a batch
//! of buffers to completion.

use bytes::BytesMut;

use uf_interface::{NextHop, PacketMeta};

use crate::classify::{Classifier, ClassifyTrace};
use crate::flowtable::FlowTable;

pub struct Worker {
    pub flows: FlowTable,
    pub classifier: Classifier,
}

impl Worker {
    pub fn new(flows: FlowTable, classifier: Classifier) -> Worker {
        Worker { flows, classifier }
    }

    /// Processes one buffer batch. The wheel is advanced first so expiry
    /// lag never exceeds a batch. The end of the call is the worker's
    /// quiescent point: no rule-set handle survives it.
    pub fn process_batch(
        &mut self,
        now: u32,
        batch: &mut [(PacketMeta, BytesMut)],
    ) -> Vec<(NextHop, ClassifyTrace)> {
        self.flows.expire(now);
        batch
            .iter_mut()
            .map(|(meta, data)| self.classifier.process(&mut self.flows, meta, data, now))
            .collect()
    }
}
