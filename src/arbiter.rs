//! Direction arbiter (C5): decides, deterministically and without
//! coordination, which side of a potential link dials the other (spec
//! §4.5).

use crate::mac::Mac;

/// Outcome of comparing two MAC addresses for a potential link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We should dial the remote.
    Initiate,
    /// We should wait for the remote to dial us.
    Wait,
    /// Same MAC on both sides — refuse to initiate (spec §4.5).
    Collision,
}

/// Compare `local` and `remote` as 48-bit unsigned integers. The lower MAC
/// always initiates, keeping each potential link asymmetric without
/// coordination.
pub fn arbitrate(local: Mac, remote: Mac) -> Direction {
    match local.as_u64().cmp(&remote.as_u64()) {
        std::cmp::Ordering::Less => Direction::Initiate,
        std::cmp::Ordering::Greater => Direction::Wait,
        std::cmp::Ordering::Equal => Direction::Collision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_assignment_scenario() {
        // Scenario 1 from spec §8.
        let local = Mac::parse("B8:27:EB:10:28:CD").unwrap();
        let remote = Mac::parse("B8:27:EB:A8:A7:22").unwrap();
        assert_eq!(arbitrate(local, remote), Direction::Initiate);
        assert_eq!(arbitrate(remote, local), Direction::Wait);
    }

    #[test]
    fn equal_macs_collide() {
        let mac = Mac::parse("AA:AA:AA:AA:AA:AA").unwrap();
        assert_eq!(arbitrate(mac, mac), Direction::Collision);
    }
}
