use tracing::{debug, warn};

use crate::util::parse::parse_leading_int;

pub type PeerId = i32;

/// the id of a session that has not (yet) been assigned an id by the server
pub const NO_PEER_ID: PeerId = -1;

/// One line of the server's peer list: `name,id,connected`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerEntry {
    pub name: String,
    pub id: PeerId,
    pub connected: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerRecord {
    pub id: PeerId,
    pub name: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RosterEvent {
    Joined(PeerRecord),
    Left(PeerId),
}

/// Parses a single roster line. The server only ever emits well-formed lines, so the parsing is
///  lenient: id and flag are the leading integers of their fields, a missing field counts as 0.
///  A line without a name is rejected.
pub fn parse_entry(line: &str) -> Option<PeerEntry> {
    let line = line.trim_end_matches('\r');

    let mut fields = line.splitn(3, ',');
    let name = fields.next()?;
    if name.is_empty() {
        return None;
    }
    let id = fields.next()
        .and_then(parse_leading_int)
        .unwrap_or(0);
    let connected = fields.next()
        .and_then(parse_leading_int)
        .unwrap_or(0) > 0;

    Some(PeerEntry {
        name: name.to_string(),
        id,
        connected,
    })
}

/// The peers currently known to a session, in the order they became known
#[derive(Debug, Default)]
pub struct Roster {
    peers: Vec<PeerRecord>,
}

impl Roster {
    pub fn new() -> Roster {
        Default::default()
    }

    /// Replaces the roster with the peer list from a sign-in response. Every well-formed line except
    ///  the session's own entry becomes a peer, irrespective of its connected flag.
    pub fn apply_initial_list(&mut self, body: &str, self_id: PeerId) -> Vec<RosterEvent> {
        self.peers.clear();

        let mut events = Vec::new();
        for line in body.lines() {
            if line.is_empty() {
                continue;
            }
            match parse_entry(line) {
                Some(entry) if entry.id == self_id => {}
                Some(entry) => {
                    if let Some(event) = self.insert(entry.id, entry.name) {
                        events.push(event);
                    }
                }
                None => warn!("skipping malformed roster line {:?}", line),
            }
        }
        debug!("initial roster: {:?}", self.peers);
        events
    }

    /// Applies a single roster change from a long-poll notification. A peer that is reported as
    ///  disconnected is reported as having left even if it was not known.
    pub fn apply_delta(&mut self, entry: PeerEntry, self_id: PeerId) -> Option<RosterEvent> {
        if entry.id == self_id {
            return None;
        }

        if entry.connected {
            self.insert(entry.id, entry.name)
        }
        else {
            self.peers.retain(|p| p.id != entry.id);
            Some(RosterEvent::Left(entry.id))
        }
    }

    fn insert(&mut self, id: PeerId, name: String) -> Option<RosterEvent> {
        match self.peers.iter_mut().find(|p| p.id == id) {
            Some(existing) if existing.name == name => None,
            Some(existing) => {
                existing.name = name.clone();
                Some(RosterEvent::Joined(PeerRecord { id, name }))
            }
            None => {
                self.peers.push(PeerRecord { id, name: name.clone() });
                Some(RosterEvent::Joined(PeerRecord { id, name }))
            }
        }
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn get(&self, id: PeerId) -> Option<&str> {
        self.peers.iter()
            .find(|p| p.id == id)
            .map(|p| p.name.as_str())
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use rand::Rng;
    use rstest::rstest;
    use super::*;

    fn record(id: PeerId, name: &str) -> PeerRecord {
        PeerRecord { id, name: name.to_string() }
    }

    fn entry(name: &str, id: PeerId, connected: bool) -> PeerEntry {
        PeerEntry { name: name.to_string(), id, connected }
    }

    #[rstest]
    #[case::regular("alice,1,1", Some(entry("alice", 1, true)))]
    #[case::disconnected("alice,1,0", Some(entry("alice", 1, false)))]
    #[case::carriage_return("alice,1,1\r", Some(entry("alice", 1, true)))]
    #[case::flag_above_one("bob,12,2", Some(entry("bob", 12, true)))]
    #[case::missing_flag("bob,12", Some(entry("bob", 12, false)))]
    #[case::missing_id("bob", Some(entry("bob", 0, false)))]
    #[case::name_with_space("bob smith,4,1", Some(entry("bob smith", 4, true)))]
    #[case::empty_name(",3,1", None)]
    #[case::empty_line("", None)]
    fn test_parse_entry(#[case] line: &str, #[case] expected: Option<PeerEntry>) {
        assert_eq!(parse_entry(line), expected);
    }

    #[test]
    fn test_initial_list() {
        let mut roster = Roster::new();
        let events = roster.apply_initial_list("alice,1,1\nbob,2,1", 3);

        assert_eq!(events, vec![
            RosterEvent::Joined(record(1, "alice")),
            RosterEvent::Joined(record(2, "bob")),
        ]);
        assert_eq!(roster.peers(), &[record(1, "alice"), record(2, "bob")]);
    }

    #[test]
    fn test_initial_list_skips_self_and_ignores_flag() {
        let mut roster = Roster::new();
        let events = roster.apply_initial_list("me,3,1\nalice,1,0\n", 3);

        assert_eq!(events, vec![RosterEvent::Joined(record(1, "alice"))]);
        assert!(!roster.contains(3));
    }

    #[rstest]
    #[case::first_line(",9,1\nalice,1,1\nbob,2,1\ncarol,4,1", 3)]
    #[case::middle_line("alice,1,1\n,9,1\nbob,2,1", 2)]
    #[case::last_line("alice,1,1\n,", 1)]
    fn test_initial_list_skips_malformed_line(#[case] body: &str, #[case] expected_len: usize) {
        let mut roster = Roster::new();
        let events = roster.apply_initial_list(body, 3);

        assert_eq!(events.len(), expected_len);
        assert_eq!(roster.len(), expected_len);
        assert!(!roster.contains(9));
    }

    #[test]
    fn test_delta() {
        let mut roster = Roster::new();
        roster.apply_initial_list("alice,1,1", 3);

        assert_eq!(roster.apply_delta(entry("bob", 2, true), 3), Some(RosterEvent::Joined(record(2, "bob"))));
        assert_eq!(roster.apply_delta(entry("alice", 1, false), 3), Some(RosterEvent::Left(1)));
        assert_eq!(roster.apply_delta(entry("me", 3, true), 3), None);
        assert_eq!(roster.apply_delta(entry("bob", 2, true), 3), None);
        assert_eq!(roster.apply_delta(entry("bobby", 2, true), 3), Some(RosterEvent::Joined(record(2, "bobby"))));
        assert_eq!(roster.apply_delta(entry("zed", 7, false), 3), Some(RosterEvent::Left(7)));

        assert_eq!(roster.peers(), &[record(2, "bobby")]);
    }

    #[test]
    fn test_delta_sequences_track_latest_state() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut roster = Roster::new();
            let mut expected = BTreeMap::new();

            for _ in 0..rng.gen_range(0..50) {
                let id = rng.gen_range(0..8);
                let connected = rng.gen_bool(0.6);
                let name = format!("peer{}", rng.gen_range(0..3));

                roster.apply_delta(entry(&name, id, connected), 99);
                if connected {
                    expected.insert(id, name);
                }
                else {
                    expected.remove(&id);
                }
            }

            let actual = roster.peers().iter()
                .map(|p| (p.id, p.name.clone()))
                .collect::<BTreeMap<_, _>>();
            assert_eq!(actual, expected);
            assert_eq!(roster.len(), expected.len());
        }
    }

    #[test]
    fn test_clear() {
        let mut roster = Roster::new();
        roster.apply_initial_list("alice,1,1\nbob,2,1", 3);
        roster.clear();
        assert!(roster.is_empty());
        assert_eq!(roster.get(1), None);
    }
}
