// Stream State Contract Tests
//
// The pool stores stream states in an AtomicU8 and claims terminal states
// with compare-and-set, so the u8 encoding and the terminal classification
// are load-bearing.

use common::{StreamId, StreamState, TerminalReason, FIRST_CLIENT_STREAM_ID, MAX_STREAM_ID};

const ALL_STATES: [StreamState; 6] = [
    StreamState::Created,
    StreamState::Active,
    StreamState::Completed,
    StreamState::Reset,
    StreamState::TimedOut,
    StreamState::Errored,
];

#[test]
fn test_state_u8_encoding_is_stable() {
    for state in ALL_STATES {
        assert_eq!(StreamState::from_u8(state.as_u8()), Some(state));
    }
    assert_eq!(StreamState::from_u8(6), None);
    assert_eq!(StreamState::from_u8(255), None);
}

#[test]
fn test_only_four_states_are_terminal() {
    let terminal: Vec<_> = ALL_STATES.iter().filter(|s| s.is_terminal()).collect();
    assert_eq!(terminal.len(), 4);
    assert!(!StreamState::Created.is_terminal());
    assert!(!StreamState::Active.is_terminal());
}

#[test]
fn test_terminal_reason_maps_to_matching_state() {
    let cases = vec![
        (TerminalReason::Completed, StreamState::Completed),
        (TerminalReason::Reset, StreamState::Reset),
        (TerminalReason::TimedOut, StreamState::TimedOut),
        (TerminalReason::Errored, StreamState::Errored),
    ];

    for (reason, expected) in cases {
        assert_eq!(reason.state(), expected);
        assert_eq!(StreamState::from(reason), expected);
        assert!(expected.is_terminal());
        // Same discriminant so a reason can be CAS'd straight into the state atomic
        assert_eq!(reason as u8, expected.as_u8());
    }
}

#[test]
fn test_client_stream_ids_are_odd() {
    let first = StreamId(FIRST_CLIENT_STREAM_ID);
    let second = first.next().unwrap();
    let third = second.next().unwrap();
    assert_eq!((first.0, second.0, third.0), (1, 3, 5));
}

#[test]
fn test_stream_id_space_exhaustion() {
    assert_eq!(StreamId(MAX_STREAM_ID).next(), None);
    assert_eq!(StreamId(MAX_STREAM_ID - 2).next(), Some(StreamId(MAX_STREAM_ID)));
}
