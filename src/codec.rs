//! Fragment codec (C1): splits a packet into MTU-sized fragments and
//! rejoins fragments into a packet, per the typed header form normative in
//! spec §3 and §4.1.
//!
//! Wire layout of one fragment:
//!
//! | offset | width | field   |
//! |-------:|------:|---------|
//! |      0 |     1 | type (bit0=START, bit1=END) |
//! |      1 |     2 | seq (big-endian) |
//! |      3 |     2 | total (big-endian) |
//! |      5 |   ≤MTU-5 | payload |

use crate::error::{Error, Result};

const HEADER_LEN: usize = 5;
const START_BIT: u8 = 0b01;
const END_BIT: u8 = 0b10;

/// One on-wire fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub start: bool,
    pub end: bool,
    pub seq: u16,
    pub total: u16,
    pub payload: Vec<u8>,
}

impl Fragment {
    /// Encode this fragment to its wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        let mut ty = 0u8;
        if self.start {
            ty |= START_BIT;
        }
        if self.end {
            ty |= END_BIT;
        }
        out.push(ty);
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.total.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a fragment from its wire representation.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let ty = bytes[0];
        let seq = u16::from_be_bytes([bytes[1], bytes[2]]);
        let total = u16::from_be_bytes([bytes[3], bytes[4]]);
        Some(Self {
            start: ty & START_BIT != 0,
            end: ty & END_BIT != 0,
            seq,
            total,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

/// Split `packet` into fragments sized to fit `mtu`.
///
/// `payload_size = mtu - 5`. Fails with [`Error::MtuTooSmall`] if
/// `mtu < 23`, or [`Error::PacketTooLarge`] if the packet would need more
/// than 65535 fragments. A zero-length packet yields exactly one fragment
/// with both START and END set and an empty payload (spec §4.1, §8).
pub fn encode(packet: &[u8], mtu: usize) -> Result<Vec<Fragment>> {
    if mtu < crate::wire::MIN_MTU {
        return Err(Error::MtuTooSmall(mtu));
    }
    let payload_size = mtu - HEADER_LEN;

    let n = if packet.is_empty() {
        1
    } else {
        packet.len().div_ceil(payload_size)
    };
    if n > u16::MAX as usize {
        return Err(Error::PacketTooLarge {
            len: packet.len(),
            mtu,
        });
    }
    let total = n as u16;

    let mut fragments = Vec::with_capacity(n);
    for i in 0..n {
        let start_off = i * payload_size;
        let end_off = ((i + 1) * payload_size).min(packet.len());
        fragments.push(Fragment {
            start: i == 0,
            end: i == n - 1,
            seq: i as u16,
            total,
            payload: packet[start_off..end_off].to_vec(),
        });
    }
    Ok(fragments)
}

/// Outcome of feeding one fragment into a reassembly buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// More fragments are needed before the packet is complete.
    Incomplete,
    /// The packet is fully reassembled.
    Complete(Vec<u8>),
}

/// In-flight partial packet for a single peer (spec §3 ReassemblyBuffer,
/// minus the timestamps owned by [`crate::reassembly`]).
#[derive(Debug, Default)]
pub struct PartialPacket {
    total: Option<u16>,
    slots: Vec<Option<Vec<u8>>>,
    received_mask: Vec<bool>,
}

impl PartialPacket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes currently buffered across all received slots — used by
    /// the reassembly buffer to enforce `max_inflight_bytes` (spec §4.2).
    pub fn buffered_bytes(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .map(|b| b.len())
            .sum()
    }

    fn reset(&mut self, total: u16) {
        self.total = Some(total);
        self.slots = vec![None; total as usize];
        self.received_mask = vec![false; total as usize];
    }

    /// Feed one fragment into this buffer.
    ///
    /// Rules (spec §4.1):
    /// - a START re-arriving resets the buffer;
    /// - duplicate mid-fragments idempotently overwrite their slot;
    /// - `seq >= total`, or `total` disagreeing with an already-buffered
    ///   `total`, fails with [`Error::FragmentInconsistent`];
    /// - an END with gaps still open fails with [`Error::ReassemblyGap`].
    pub fn feed(&mut self, fragment: Fragment) -> Result<DecodeOutcome> {
        if fragment.seq >= fragment.total {
            return Err(Error::FragmentInconsistent(format!(
                "seq {} >= total {}",
                fragment.seq, fragment.total
            )));
        }

        if fragment.start {
            self.reset(fragment.total);
        } else {
            match self.total {
                Some(total) if total == fragment.total => {}
                Some(total) => {
                    return Err(Error::FragmentInconsistent(format!(
                        "total changed mid-stream: buffered {total}, fragment {}",
                        fragment.total
                    )));
                }
                None => {
                    // Mid/END fragment arriving with no prior START.
                    return Err(Error::FragmentInconsistent(
                        "fragment arrived before a START".into(),
                    ));
                }
            }
        }

        let idx = fragment.seq as usize;
        self.slots[idx] = Some(fragment.payload);
        self.received_mask[idx] = true;

        if fragment.end {
            if self.received_mask.iter().all(|&r| r) {
                let mut out = Vec::new();
                for slot in self.slots.drain(..) {
                    out.extend(slot.expect("all slots checked present"));
                }
                return Ok(DecodeOutcome::Complete(out));
            }
            return Err(Error::ReassemblyGap);
        }

        Ok(DecodeOutcome::Incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_packet_is_one_fragment() {
        let frags = encode(&[], 23).unwrap();
        assert_eq!(frags.len(), 1);
        assert!(frags[0].start && frags[0].end);
        assert!(frags[0].payload.is_empty());
    }

    #[test]
    fn mtu_below_minimum_fails() {
        assert!(matches!(encode(&[1, 2, 3], 22), Err(Error::MtuTooSmall(22))));
    }

    #[test]
    fn exact_multiple_of_payload_size_ends_full() {
        // mtu 23 -> payload_size 18; 36 bytes = exactly two full fragments.
        let packet = vec![0x41u8; 36];
        let frags = encode(&packet, 23).unwrap();
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].payload.len(), 18);
        assert_eq!(frags[1].payload.len(), 18);
        assert!(frags[1].end);
    }

    #[test]
    fn min_mtu_18_byte_packet_is_one_fragment() {
        let packet = vec![0x01u8; 18];
        let frags = encode(&packet, 23).unwrap();
        assert_eq!(frags.len(), 1);
        assert!(frags[0].start && frags[0].end);
    }

    #[test]
    fn fragmentation_round_trip_scenario() {
        // Scenario 2 from spec §8: 233 bytes of 0x41 at MTU 23.
        let packet = vec![0x41u8; 233];
        let frags = encode(&packet, 23).unwrap();
        assert_eq!(frags.len(), 13);
        for (i, f) in frags.iter().enumerate() {
            assert_eq!(f.seq, i as u16);
            assert_eq!(f.total, 13);
        }
        assert!(frags[0].start && !frags[0].end);
        assert!(frags[12].end && !frags[12].start);
        let sizes: Vec<usize> = frags.iter().map(|f| f.payload.len()).collect();
        assert_eq!(sizes, vec![18, 18, 18, 18, 18, 18, 18, 18, 18, 18, 18, 18, 17]);

        let mut buf = PartialPacket::new();
        let mut result = None;
        for f in frags {
            match buf.feed(f).unwrap() {
                DecodeOutcome::Complete(bytes) => result = Some(bytes),
                DecodeOutcome::Incomplete => {}
            }
        }
        assert_eq!(result, Some(packet));
    }

    #[test]
    fn start_rearriving_resets_buffer() {
        let mut buf = PartialPacket::new();
        buf.feed(Fragment {
            start: true,
            end: false,
            seq: 0,
            total: 3,
            payload: vec![1],
        })
        .unwrap();
        // A fresh START for a shorter packet resets everything.
        let outcome = buf
            .feed(Fragment {
                start: true,
                end: true,
                seq: 0,
                total: 1,
                payload: vec![9],
            })
            .unwrap();
        assert_eq!(outcome, DecodeOutcome::Complete(vec![9]));
    }

    #[test]
    fn duplicate_mid_fragment_overwrites_idempotently() {
        let mut buf = PartialPacket::new();
        buf.feed(Fragment {
            start: true,
            end: false,
            seq: 0,
            total: 2,
            payload: vec![1],
        })
        .unwrap();
        buf.feed(Fragment {
            start: false,
            end: false,
            seq: 0,
            total: 2,
            payload: vec![1],
        })
        .unwrap();
        let outcome = buf
            .feed(Fragment {
                start: false,
                end: true,
                seq: 1,
                total: 2,
                payload: vec![2],
            })
            .unwrap();
        assert_eq!(outcome, DecodeOutcome::Complete(vec![1, 2]));
    }

    #[test]
    fn seq_exceeding_total_is_inconsistent() {
        let mut buf = PartialPacket::new();
        let err = buf
            .feed(Fragment {
                start: true,
                end: false,
                seq: 5,
                total: 3,
                payload: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, Error::FragmentInconsistent(_)));
    }

    #[test]
    fn total_disagreement_is_inconsistent() {
        let mut buf = PartialPacket::new();
        buf.feed(Fragment {
            start: true,
            end: false,
            seq: 0,
            total: 3,
            payload: vec![1],
        })
        .unwrap();
        let err = buf
            .feed(Fragment {
                start: false,
                end: false,
                seq: 1,
                total: 4,
                payload: vec![2],
            })
            .unwrap_err();
        assert!(matches!(err, Error::FragmentInconsistent(_)));
    }

    #[test]
    fn end_with_gap_fails() {
        let mut buf = PartialPacket::new();
        let err = buf
            .feed(Fragment {
                start: true,
                end: true,
                seq: 2,
                total: 3,
                payload: vec![3],
            })
            .unwrap_err();
        assert!(matches!(err, Error::ReassemblyGap));
    }

    #[test]
    fn wire_round_trip() {
        let f = Fragment {
            start: true,
            end: false,
            seq: 7,
            total: 100,
            payload: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        let bytes = f.to_bytes();
        let decoded = Fragment::from_bytes(&bytes).unwrap();
        assert_eq!(f, decoded);
    }

    proptest::proptest! {
        #[test]
        fn arbitrary_packet_round_trips(packet in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..4096), mtu in 23usize..600) {
            let frags = encode(&packet, mtu).unwrap();
            let expected_n = if packet.is_empty() { 1 } else { packet.len().div_ceil(mtu - 5) };
            proptest::prop_assert_eq!(frags.len(), expected_n);

            let mut buf = PartialPacket::new();
            let mut result = None;
            for f in frags {
                if let DecodeOutcome::Complete(bytes) = buf.feed(f).unwrap() {
                    result = Some(bytes);
                }
            }
            proptest::prop_assert_eq!(result, Some(packet));
        }
    }
}
