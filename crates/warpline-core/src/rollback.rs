//! Antimessage generation.
//!
//! The rest of a rollback (state restore, silent re-execution, session
//! cleanup) needs the whole node and lives in `node::timeline`; this module
//! holds the part that only touches one LP's outgoing records.

use warpline_proto::{LpId, Message, VirtualTime};

use crate::lp::LogicalProcess;

/// Summary of one rollback, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackReport {
    /// LP rolled back
    pub lp: LpId,
    /// Rollback target: entries at or after this time were undone
    pub to: VirtualTime,
    /// Antimessages issued
    pub antimessages: usize,
    /// Requester sessions aborted
    pub aborted_sessions: usize,
    /// Owner lends revoked
    pub revoked_lends: usize,
    /// Entries re-executed silently
    pub silent: usize,
}

/// Cancel everything `lp` sent at or after `from`.
///
/// Each removed outgoing record yields exactly one antimessage carrying
/// the original key; records before `from` are untouched.
pub fn send_antimessages<S>(lp: &mut LogicalProcess<S>, from: VirtualTime) -> Vec<Message> {
    lp.take_records_from(from)
        .into_iter()
        .map(|record| Message::antimessage(record.key, record.code))
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use warpline_proto::{MessageKey, MessageKind};

    use super::*;
    use crate::lp::OutgoingRecord;

    fn lp_with_records(sends: &[(u64, LpId)]) -> LogicalProcess<()> {
        let mut lp = LogicalProcess::new(0, ());
        for (send, dest) in sends {
            let seq = lp.allocate_seq(*dest);
            lp.record(OutgoingRecord {
                key: MessageKey {
                    sender: 0,
                    destination: *dest,
                    send_time: VirtualTime::new(*send),
                    recv_time: VirtualTime::new(send + 1),
                    seq,
                },
                code: None,
            });
        }
        lp
    }

    #[test]
    fn rollback_to_ten_cancels_the_event_sent_at_ten() {
        let mut lp = lp_with_records(&[(10, 1)]);
        let antis = send_antimessages(&mut lp, VirtualTime::new(10));
        assert_eq!(antis.len(), 1);
        assert_eq!(antis[0].kind, MessageKind::AntiMessage);
        assert_eq!(antis[0].key.seq, 1);
        assert_eq!(antis[0].key.send_time, VirtualTime::new(10));
        assert_eq!(antis[0].key.recv_time, VirtualTime::new(11));
    }

    proptest! {
        #[test]
        fn exactly_one_antimessage_per_undone_record(
            mut sends in prop::collection::vec((0u64..100, 0u32..4), 0..40),
            to in 0u64..110,
        ) {
            sends.sort_by_key(|(send, _)| *send);
            let mut lp = lp_with_records(&sends);
            let before: Vec<_> = lp.records().to_vec();

            let antis = send_antimessages(&mut lp, VirtualTime::new(to));

            let undone: Vec<_> = before.iter().filter(|r| r.key.send_time.ticks() >= to).collect();
            prop_assert_eq!(antis.len(), undone.len());
            for (anti, record) in antis.iter().zip(undone) {
                prop_assert_eq!(anti.key, record.key);
            }
            let kept: Vec<_> = before.iter().filter(|r| r.key.send_time.ticks() < to).copied().collect();
            prop_assert_eq!(lp.records(), kept.as_slice());
        }
    }
}
